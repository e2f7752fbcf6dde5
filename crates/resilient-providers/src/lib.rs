mod bitcoin_data;
mod price;
mod race;

pub use bitcoin_data::*;
pub use price::*;
pub use race::*;
