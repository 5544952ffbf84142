pub mod denom;
pub mod ots;
pub mod types;

pub use self::denom::{decompose, Denomination, DENOMINATIONS};
pub use self::types::*;
