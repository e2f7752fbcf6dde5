pub mod nonce_manager;
pub mod tx_executor;

pub use nonce_manager::NonceManager;
pub use tx_executor::{GasOverrides, TransactionExecutor};
