use super::types::*;
use crate::controller::{WalletStateController, WalletStatus};
use crate::core::denom::Denomination;
use crate::errors::WalletError;
use crate::mix::session::{MixPhase, PrivacyLevel};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

type AppState = Arc<WalletStateController>;

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

fn err(e: WalletError) -> ErrorResponse {
    ErrorResponse { error: e.to_string() }
}

fn parse_hex32(hex_str: &str, label: &str) -> Result<[u8; 32], ErrorResponse> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| ErrorResponse { error: format!("invalid {} hex: {}", label, e) })?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| ErrorResponse { error: format!("{} must be 32 bytes", label) })
}

fn parse_denomination(coins: u64) -> Result<Denomination, ErrorResponse> {
    coins
        .checked_mul(crate::core::types::COIN)
        .and_then(Denomination::from_amount)
        .ok_or_else(|| err(WalletError::InvalidDenomination(coins)))
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn status(State(wallet): State<AppState>) -> Result<Json<WalletStatus>, ErrorResponse> {
    wallet.status().await.map(Json).map_err(err)
}

pub async fn mint(
    State(wallet): State<AppState>,
    Json(req): Json<MintRequest>,
) -> Result<Json<MintResponse>, ErrorResponse> {
    let denom = parse_denomination(req.denomination)?;
    let count = req.count.unwrap_or(1).max(1);

    let mut commitments = Vec::with_capacity(count);
    for _ in 0..count {
        let record = wallet.mint(denom).await.map_err(err)?;
        commitments.push(hex::encode(record.commitment));
    }

    Ok(Json(MintResponse {
        commitments,
        denomination: req.denomination,
        status: "minting".to_string(),
    }))
}

pub async fn spend(
    State(wallet): State<AppState>,
    Json(req): Json<SpendRequest>,
) -> Result<Json<SpendResponse>, ErrorResponse> {
    let destination = match &req.destination {
        Some(h) if !h.is_empty() => Some(parse_hex32(h, "destination")?),
        _ => None,
    };

    let outcome = match (&req.serial, req.denomination) {
        (Some(serial_hex), _) => {
            let serial = parse_hex32(serial_hex, "serial")?;
            wallet
                .spend(serial, destination, req.security_level, None)
                .await
                .map_err(err)?
        }
        (None, Some(coins)) => {
            let denom = parse_denomination(coins)?;
            wallet
                .spend_denomination(denom, destination, req.security_level)
                .await
                .map_err(err)?
        }
        (None, None) => {
            return Err(ErrorResponse {
                error: "provide a serial or a denomination".into(),
            });
        }
    };

    Ok(Json(SpendResponse {
        txid: hex::encode(outcome.record.txid),
        serial: hex::encode(outcome.record.serial),
        anonymity_set_size: outcome.record.anonymity_set_size,
        reminted: outcome.reminted.iter().map(|m| m.denomination.coins()).collect(),
        status: "broadcast".to_string(),
    }))
}

pub async fn mix_start(
    State(wallet): State<AppState>,
    Json(req): Json<MixStartRequest>,
) -> Result<Json<MixStartResponse>, ErrorResponse> {
    let denom = parse_denomination(req.denomination)?;
    let privacy = match req.privacy.as_deref() {
        None => None,
        Some("low") => Some(PrivacyLevel::Low),
        Some("medium") => Some(PrivacyLevel::Medium),
        Some("high") => Some(PrivacyLevel::High),
        Some(other) => {
            return Err(ErrorResponse {
                error: format!("unknown privacy level: {}", other),
            });
        }
    };

    let nonce = wallet.start_mixing(denom, privacy).await.map_err(err)?;
    Ok(Json(MixStartResponse {
        session: hex::encode(nonce),
        denomination: req.denomination,
        status: "queued".to_string(),
    }))
}

pub async fn mix_status(
    State(wallet): State<AppState>,
    Path(session_hex): Path<String>,
) -> Result<Json<MixStatusResponse>, ErrorResponse> {
    let nonce = parse_hex32(&session_hex, "session")?;
    let session = wallet
        .mix_session(&nonce)
        .await
        .ok_or_else(|| ErrorResponse { error: "mix session not found".into() })?;

    let phase_str = match &session.phase {
        MixPhase::Idle => "idle",
        MixPhase::Queued => "queued",
        MixPhase::Pooled => "pooled",
        MixPhase::Signed => "signed",
        MixPhase::Broadcast => "broadcast",
        MixPhase::Failed(_) => "failed",
        MixPhase::TimedOut => "timed_out",
    };

    Ok(Json(MixStatusResponse {
        session: session_hex,
        phase: phase_str.to_string(),
        queue_have: session.queue_have,
        queue_need: session.queue_need,
    }))
}

pub async fn reset_shielded(
    State(wallet): State<AppState>,
) -> Result<Json<ResetResponse>, ErrorResponse> {
    let discarded = wallet.reset_shielded_db().await.map_err(err)?;
    Ok(Json(ResetResponse { discarded }))
}

pub async fn rescan_shielded(
    State(wallet): State<AppState>,
) -> Result<Json<RescanResponse>, ErrorResponse> {
    let updated = wallet.rescan_shielded().await.map_err(err)?;
    Ok(Json(RescanResponse { updated }))
}

pub async fn fresh_address(
    State(wallet): State<AppState>,
) -> Result<Json<AddressResponse>, ErrorResponse> {
    let address = wallet.fresh_address(None).await.map_err(err)?;
    Ok(Json(AddressResponse { address: hex::encode(address) }))
}

pub async fn history(
    State(wallet): State<AppState>,
) -> Result<Json<HistoryResponse>, ErrorResponse> {
    let spends = wallet.spend_history().map_err(err)?;
    Ok(Json(HistoryResponse {
        spends: spends
            .into_iter()
            .map(|s| HistoryEntry {
                serial: hex::encode(s.serial),
                denomination: s.denomination.coins(),
                destination: hex::encode(s.destination),
                txid: hex::encode(s.txid),
                anonymity_set_size: s.anonymity_set_size,
                timestamp: s.created_at,
            })
            .collect(),
    }))
}
