/// RocksDB 存储
/// 列族 "messages": key 为 32 字节消息哈希，value 为消息 JSON
/// 列族 "cursors": key 为大端 chain_id，value 为大端下一起始区块
use std::path::Path;
use std::sync::Arc;

use alloy_primitives::B256;
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, DB};

use super::{sort_unfinished, MessageStore};
use crate::{types::CrossChainMessage, Error, Result};

const MESSAGES_CF: &str = "messages";
const CURSORS_CF: &str = "cursors";

pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(MESSAGES_CF, Options::default()),
            ColumnFamilyDescriptor::new(CURSORS_CF, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, path.as_ref(), cfs)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Missing column family: {}", name)))
    }

    fn decode(bytes: &[u8]) -> Result<CrossChainMessage> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl MessageStore for RocksStore {
    fn insert_if_absent(&self, message: &CrossChainMessage) -> Result<bool> {
        if self.get_message(&message.message_hash)?.is_some() {
            return Ok(false);
        }
        self.put_message(message)?;
        Ok(true)
    }

    fn put_message(&self, message: &CrossChainMessage) -> Result<()> {
        let cf = self.cf(MESSAGES_CF)?;
        let value = serde_json::to_vec(message).map_err(|e| Error::Serialization(e.to_string()))?;
        self.db
            .put_cf(cf, message.message_hash.as_slice(), value)
            .map_err(|e| Error::Storage(e.to_string()))
    }

    fn get_message(&self, message_hash: &B256) -> Result<Option<CrossChainMessage>> {
        let cf = self.cf(MESSAGES_CF)?;
        let value = self
            .db
            .get_cf(cf, message_hash.as_slice())
            .map_err(|e| Error::Storage(e.to_string()))?;
        value.map(|bytes| Self::decode(&bytes)).transpose()
    }

    fn unfinished_messages(&self) -> Result<Vec<CrossChainMessage>> {
        let cf = self.cf(MESSAGES_CF)?;
        let mut messages = Vec::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = entry.map_err(|e| Error::Storage(e.to_string()))?;
            messages.push(Self::decode(&value)?);
        }
        Ok(sort_unfinished(messages))
    }

    fn load_cursor(&self, chain_id: u64) -> Result<Option<u64>> {
        let cf = self.cf(CURSORS_CF)?;
        let value = self
            .db
            .get_cf(cf, chain_id.to_be_bytes())
            .map_err(|e| Error::Storage(e.to_string()))?;

        match value {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage(format!("Corrupt cursor for chain {}", chain_id)))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
        }
    }

    fn save_cursor(&self, chain_id: u64, next_block: u64) -> Result<()> {
        let cf = self.cf(CURSORS_CF)?;
        self.db
            .put_cf(cf, chain_id.to_be_bytes(), next_block.to_be_bytes())
            .map_err(|e| Error::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{exercise_store, message};

    #[test]
    fn test_rocks_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        exercise_store(&store);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let msg = message(9);
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.put_message(&msg).unwrap();
            store.save_cursor(11155111, 5000).unwrap();
        }

        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.get_message(&msg.message_hash).unwrap(), Some(msg));
        assert_eq!(store.load_cursor(11155111).unwrap(), Some(5000));
        assert_eq!(store.unfinished_messages().unwrap().len(), 1);
    }
}
