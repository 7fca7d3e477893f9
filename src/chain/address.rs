//! TRON Address Helpers
//!
//! Base58check addresses are 21 bytes: a `0x41` prefix followed by the
//! 20-byte account hash. ABI parameters drop the prefix.

use secp256k1::PublicKey;
use sha3::{Digest, Keccak256};

use super::ChainError;

/// Mainnet address prefix byte
pub const ADDRESS_PREFIX: u8 = 0x41;

/// Length of a decoded address including the prefix
pub const ADDRESS_LEN: usize = 21;

/// Decode a base58check address to its 21 raw bytes
pub fn decode_base58(address: &str) -> Result<[u8; ADDRESS_LEN], ChainError> {
    let bytes = bs58::decode(address.trim())
        .with_check(None)
        .into_vec()
        .map_err(|e| ChainError::InvalidAddress(format!("{}: {}", address, e)))?;

    if bytes.len() != ADDRESS_LEN || bytes[0] != ADDRESS_PREFIX {
        return Err(ChainError::InvalidAddress(format!(
            "{}: not a TRON address",
            address
        )));
    }

    let mut out = [0u8; ADDRESS_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Encode 21 raw bytes as a base58check address
pub fn encode_base58(raw: &[u8; ADDRESS_LEN]) -> String {
    bs58::encode(raw).with_check().into_string()
}

/// Hex form (`41...`) used by some node endpoints
pub fn to_hex(address: &str) -> Result<String, ChainError> {
    Ok(hex::encode(decode_base58(address)?))
}

pub fn is_valid(address: &str) -> bool {
    decode_base58(address).is_ok()
}

/// Address controlled by a secp256k1 public key
pub fn from_public_key(key: &PublicKey) -> String {
    let uncompressed = key.serialize_uncompressed();
    let hash = Keccak256::digest(&uncompressed[1..]);

    let mut raw = [0u8; ADDRESS_LEN];
    raw[0] = ADDRESS_PREFIX;
    raw[1..].copy_from_slice(&hash[12..]);
    encode_base58(&raw)
}

/// ABI parameters for `transfer(address,uint256)`
pub fn encode_transfer_params(destination: &str, amount_units: u128) -> Result<String, ChainError> {
    let raw = decode_base58(destination)?;
    Ok(format!(
        "{:0>64}{:064x}",
        hex::encode(&raw[1..]),
        amount_units
    ))
}
