mod chain;
mod events;
mod rebalance;
pub mod serde_utils;
mod token;
mod trade;
mod transfer;

pub use chain::*;
pub use events::*;
pub use rebalance::*;
pub use token::*;
pub use trade::*;
pub use transfer::*;
