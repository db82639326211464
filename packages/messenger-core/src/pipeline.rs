//! 监听器到执行器之间的有界消息通道
//!
//! 多个监听器共享 [`MessagePublisher`]，唯一的执行器持有 [`MessageReceiver`]。
//! 通道满时发布方挂起等待，不丢弃消息。

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{types::CrossChainMessage, Error, Result};

pub fn channel(capacity: usize) -> (MessagePublisher, MessageReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (MessagePublisher { tx }, MessageReceiver { rx })
}

#[derive(Clone)]
pub struct MessagePublisher {
    tx: mpsc::Sender<CrossChainMessage>,
}

impl MessagePublisher {
    /// 发布消息，通道满时等待；取消信号到达则放弃发布
    pub async fn publish(
        &self,
        message: CrossChainMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            sent = self.tx.send(message) => sent.map_err(|_| Error::PipelineClosed),
        }
    }
}

pub struct MessageReceiver {
    rx: mpsc::Receiver<CrossChainMessage>,
}

impl MessageReceiver {
    /// 所有发布方都已释放且队列为空时返回 None
    pub async fn next(&mut self) -> Option<CrossChainMessage> {
        self.rx.recv().await
    }
}
