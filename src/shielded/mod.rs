//! Shielded-denomination subsystem: mint engine, spend engine, commitment
//! accumulator, and the spent-serial set.

pub mod accumulator;
pub mod mint;
pub mod serials;
pub mod spend;
