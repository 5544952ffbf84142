//! Lamport one-time signatures over BLAKE3.
//!
//! Each denominated coin is controlled by a one-time key: the coin is signed
//! away exactly once (in a mixing proposal or a plain transfer), so one-time
//! security suffices and the scheme stays hash-only.
//!
//! Layout: 256 secret pairs sk[i][b] = BLAKE3(seed || i || b). The public key
//! compresses all 512 leaf hashes. A signature reveals one preimage per
//! message bit plus the sibling leaf hash, letting the verifier rebuild the
//! exact leaf sequence and compress it back to the public key.
//!
//! Signature size: 512 × 32 = 16 KiB.

use super::types::hash;

pub const MSG_BITS: usize = 256;
pub const SIG_ELEMENTS: usize = MSG_BITS * 2;
pub const SIG_SIZE: usize = SIG_ELEMENTS * 32;

/// Secret leaf element: sk[i][b] = BLAKE3(seed || i_le || b)
fn leaf_secret(seed: &[u8; 32], i: usize, b: u8) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(seed);
    hasher.update(&(i as u32).to_le_bytes());
    hasher.update(&[b]);
    *hasher.finalize().as_bytes()
}

fn message_bit(msg: &[u8; 32], i: usize) -> u8 {
    (msg[i / 8] >> (7 - (i % 8))) & 1
}

/// Derive the public key for a seed.
///
/// pk = BLAKE3(H(sk[0][0]) || H(sk[0][1]) || … || H(sk[255][1]))
pub fn keygen(seed: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for i in 0..MSG_BITS {
        hasher.update(&hash(&leaf_secret(seed, i, 0)));
        hasher.update(&hash(&leaf_secret(seed, i, 1)));
    }
    *hasher.finalize().as_bytes()
}

/// Sign a 32-byte message.
///
/// For bit i: element 2i is the revealed preimage for the message bit,
/// element 2i+1 is the *hash* of the unrevealed sibling.
pub fn sign(seed: &[u8; 32], msg: &[u8; 32]) -> Vec<[u8; 32]> {
    let mut sig = Vec::with_capacity(SIG_ELEMENTS);
    for i in 0..MSG_BITS {
        let bit = message_bit(msg, i);
        sig.push(leaf_secret(seed, i, bit));
        sig.push(hash(&leaf_secret(seed, i, 1 - bit)));
    }
    sig
}

/// Verify a signature against a message and public key.
pub fn verify(sig: &[[u8; 32]], msg: &[u8; 32], pk: &[u8; 32]) -> bool {
    if sig.len() != SIG_ELEMENTS {
        return false;
    }
    let mut hasher = blake3::Hasher::new();
    for i in 0..MSG_BITS {
        let revealed = hash(&sig[i * 2]);
        let sibling = sig[i * 2 + 1];
        if message_bit(msg, i) == 0 {
            hasher.update(&revealed);
            hasher.update(&sibling);
        } else {
            hasher.update(&sibling);
            hasher.update(&revealed);
        }
    }
    *hasher.finalize().as_bytes() == *pk
}

/// Serialize a signature to bytes.
pub fn sig_to_bytes(sig: &[[u8; 32]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(sig.len() * 32);
    for chunk in sig {
        out.extend_from_slice(chunk);
    }
    out
}

/// Deserialize a signature from bytes. Returns `None` on length mismatch.
pub fn sig_from_bytes(bytes: &[u8]) -> Option<Vec<[u8; 32]>> {
    if bytes.len() != SIG_SIZE {
        return None;
    }
    Some(
        bytes
            .chunks_exact(32)
            .map(|c| <[u8; 32]>::try_from(c).expect("chunk is 32 bytes"))
            .collect(),
    )
}
