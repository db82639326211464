//! 源链与目标链 Messenger 合约的 ABI 绑定

use alloy::sol;

sol! {
    #[derive(Debug, PartialEq)]
    contract SourceMessenger {
        event MessageSent(
            uint256 indexed nonce,
            uint256 indexed destinationChainId,
            address indexed sender,
            bytes payload,
            uint256 timestamp
        );

        function sendMessage(uint256 destChainId, bytes payload) external returns (bytes32);

        function getMessageHash(
            uint256 nonce,
            uint256 sourceChainId,
            uint256 destChainId,
            address sender,
            bytes payload,
            uint256 timestamp
        ) external pure returns (bytes32);

        function nonce() external view returns (uint256);
    }
}

sol! {
    #[derive(Debug, PartialEq)]
    contract DestinationMessenger {
        function isProcessed(bytes32 messageHash) external view returns (bool);

        function receiveMessage(
            uint256 nonce,
            uint256 sourceChainId,
            address sender,
            bytes payload,
            uint256 timestamp
        ) external returns (bytes32);

        function relayer() external view returns (address);
    }
}
