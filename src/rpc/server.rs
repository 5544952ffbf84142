use super::handlers::*;
use crate::controller::WalletStateController;
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct RpcServer {
    addr: SocketAddr,
}

impl RpcServer {
    pub fn new(port: u16) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        Self { addr }
    }

    pub fn router(wallet: Arc<WalletStateController>) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/status", get(status))
            .route("/address", get(fresh_address))
            .route("/mint", post(mint))
            .route("/spend", post(spend))
            .route("/mix/start", post(mix_start))
            .route("/mix/:session", get(mix_status))
            .route("/shielded/reset", post(reset_shielded))
            .route("/shielded/rescan", post(rescan_shielded))
            .route("/history", get(history))
            .layer(TraceLayer::new_for_http())
            .with_state(wallet)
    }

    pub async fn run(self, wallet: Arc<WalletStateController>) -> Result<()> {
        let app = Self::router(wallet);
        tracing::info!("RPC server listening on {}", self.addr);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}
