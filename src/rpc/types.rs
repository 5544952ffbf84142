use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Deserialize)]
pub struct MintRequest {
    /// Denomination in whole coins.
    pub denomination: u64,
    /// How many coins to mint; defaults to 1.
    pub count: Option<usize>,
}

#[derive(Serialize)]
pub struct MintResponse {
    pub commitments: Vec<String>,
    pub denomination: u64,
    pub status: String,
}

#[derive(Deserialize)]
pub struct SpendRequest {
    /// Spend a specific mint (serial hex) or the oldest of a denomination.
    pub serial: Option<String>,
    pub denomination: Option<u64>,
    /// Empty destination pays a fresh local address.
    pub destination: Option<String>,
    /// 1-100; higher builds a larger anonymity set.
    pub security_level: Option<u8>,
}

#[derive(Serialize)]
pub struct SpendResponse {
    pub txid: String,
    pub serial: String,
    pub anonymity_set_size: usize,
    pub reminted: Vec<u64>,
    pub status: String,
}

#[derive(Deserialize)]
pub struct MixStartRequest {
    pub denomination: u64,
    /// "low" (2 peers), "medium" (8), or "high" (16).
    pub privacy: Option<String>,
}

#[derive(Serialize)]
pub struct MixStartResponse {
    pub session: String,
    pub denomination: u64,
    pub status: String,
}

#[derive(Serialize)]
pub struct MixStatusResponse {
    pub session: String,
    pub phase: String,
    pub queue_have: usize,
    pub queue_need: usize,
}

#[derive(Serialize)]
pub struct ResetResponse {
    pub discarded: usize,
}

#[derive(Serialize)]
pub struct RescanResponse {
    pub updated: usize,
}

#[derive(Serialize)]
pub struct AddressResponse {
    pub address: String,
}

#[derive(Serialize)]
pub struct HistoryEntry {
    pub serial: String,
    pub denomination: u64,
    pub destination: String,
    pub txid: String,
    pub anonymity_set_size: usize,
    pub timestamp: u64,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub spends: Vec<HistoryEntry>,
}
