pub mod bridge;
pub mod chain_manager;
pub mod height_attestor;
pub mod networking;

pub use bridge::{sign_transfer, BridgeConfig, BridgeError, CrossChainBridge};
pub use chain_manager::{ChainConnectionManager, ChainError};
pub use height_attestor::LedgerHeightAttestor;
pub use networking::{JsonRpcConnector, JsonRpcLedgerClient};
