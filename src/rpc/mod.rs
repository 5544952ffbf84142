//! Thin HTTP wrapper over [`crate::controller::WalletStateController`].

pub mod handlers;
pub mod server;
pub mod types;

pub use server::RpcServer;
