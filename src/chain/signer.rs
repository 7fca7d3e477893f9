//! Custodial Key Signer
//!
//! TRON signs the transaction id (sha256 of the raw data) with a recoverable
//! secp256k1 signature: 65 bytes `r || s || v`, hex encoded, appended to the
//! transaction's `signature` array.
//!
//! Nothing is signed unless the raw data decodes to exactly the requested
//! transfer.

use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::address;
use super::transaction::{DecodedTransfer, TransactionError};
use super::{SignedTransfer, TransferRequest, UnsignedTransfer};

/// Signing errors
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid custodial key: {0}")]
    InvalidKey(String),

    #[error("transaction id mismatch: node said {claimed}, raw data hashes to {computed}")]
    IntegrityMismatch { claimed: String, computed: String },

    #[error("malformed transaction: {0}")]
    Malformed(String),

    #[error("refusing to sign: {0}")]
    Transaction(#[from] TransactionError),
}

/// Signs node-built transfers with the custodial key
#[cfg_attr(test, mockall::automock)]
pub trait TransferSigner: Send + Sync {
    /// Address controlled by the key
    fn address(&self) -> String;

    /// Sign `unsigned` if it performs `request` and nothing else
    fn sign(
        &self,
        request: &TransferRequest,
        unsigned: &UnsignedTransfer,
    ) -> Result<SignedTransfer, SignerError>;
}

/// Signer backed by one in-process secp256k1 key
pub struct SingleKeySigner {
    secret: SecretKey,
    address: String,
}

impl std::fmt::Debug for SingleKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleKeySigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl SingleKeySigner {
    /// Load from a hex private key, with or without `0x`
    pub fn from_hex(key_hex: &str) -> Result<Self, SignerError> {
        let trimmed = key_hex.trim().trim_start_matches("0x");
        let bytes = hex::decode(trimmed).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let secret =
            SecretKey::from_slice(&bytes).map_err(|e| SignerError::InvalidKey(e.to_string()))?;

        let public = PublicKey::from_secret_key(SECP256K1, &secret);
        Ok(Self {
            secret,
            address: address::from_public_key(&public),
        })
    }

    /// Verify that `txID` really is the hash of `raw_data_hex`
    fn verify_tx_id(unsigned: &UnsignedTransfer) -> Result<[u8; 32], SignerError> {
        let raw = hex::decode(&unsigned.raw_data_hex)
            .map_err(|e| SignerError::Malformed(format!("raw_data_hex: {}", e)))?;
        let digest: [u8; 32] = Sha256::digest(&raw).into();

        let computed = hex::encode(digest);
        if !computed.eq_ignore_ascii_case(&unsigned.tx_id) {
            return Err(SignerError::IntegrityMismatch {
                claimed: unsigned.tx_id.clone(),
                computed,
            });
        }
        Ok(digest)
    }
}

impl TransferSigner for SingleKeySigner {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn sign(
        &self,
        request: &TransferRequest,
        unsigned: &UnsignedTransfer,
    ) -> Result<SignedTransfer, SignerError> {
        let digest = Self::verify_tx_id(unsigned)?;
        let decoded = DecodedTransfer::from_raw_hex(&unsigned.raw_data_hex)?;
        decoded.ensure_matches(request)?;

        let message = Message::from_digest(digest);
        let signature = SECP256K1.sign_ecdsa_recoverable(&message, &self.secret);
        let (recovery_id, compact) = signature.serialize_compact();

        let mut sig = Vec::with_capacity(65);
        sig.extend_from_slice(&compact);
        sig.push(recovery_id.to_i32() as u8);

        let mut payload = unsigned.payload.clone();
        let object = payload
            .as_object_mut()
            .ok_or_else(|| SignerError::Malformed("transaction is not an object".to_string()))?;
        object.insert(
            "signature".to_string(),
            serde_json::json!([hex::encode(sig)]),
        );

        Ok(SignedTransfer {
            tx_id: unsigned.tx_id.clone(),
            expires_at: decoded.expires_at,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{raw_transfer, transfer_request, unsigned_transfer, TEST_KEY};
    use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};

    #[test]
    fn test_key_loading() {
        let signer = SingleKeySigner::from_hex(TEST_KEY).unwrap();
        assert!(address::is_valid(&signer.address()));
        assert!(!format!("{:?}", signer).contains("0707"));

        assert!(SingleKeySigner::from_hex("zz").is_err());
        assert!(SingleKeySigner::from_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn test_signature_recovers_to_signer() {
        let signer = SingleKeySigner::from_hex(TEST_KEY).unwrap();
        let request = transfer_request(25_000_000);
        let unsigned = unsigned_transfer(&hex::encode(raw_transfer(&request, 1_700_000_060_000, 1)));
        let signed = signer.sign(&request, &unsigned).unwrap();

        let sig_hex = signed.payload["signature"][0].as_str().unwrap();
        let sig = hex::decode(sig_hex).unwrap();
        assert_eq!(sig.len(), 65);

        let recovery = RecoveryId::from_i32(sig[64] as i32).unwrap();
        let recoverable = RecoverableSignature::from_compact(&sig[..64], recovery).unwrap();
        let digest: [u8; 32] = hex::decode(&unsigned.tx_id).unwrap().try_into().unwrap();
        let public = SECP256K1
            .recover_ecdsa(&Message::from_digest(digest), &recoverable)
            .unwrap();

        assert_eq!(address::from_public_key(&public), signer.address());
        assert_eq!(signed.tx_id, unsigned.tx_id);
        assert_eq!(signed.expires_at, 1_700_000_060);
    }

    #[test]
    fn test_tampered_tx_id_is_refused() {
        let signer = SingleKeySigner::from_hex(TEST_KEY).unwrap();
        let request = transfer_request(25_000_000);
        let mut unsigned = unsigned_transfer(&hex::encode(raw_transfer(&request, 0, 1)));
        unsigned.tx_id = "00".repeat(32);

        assert!(matches!(
            signer.sign(&request, &unsigned),
            Err(SignerError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn test_node_substituted_transfer_is_refused() {
        let signer = SingleKeySigner::from_hex(TEST_KEY).unwrap();
        let request = transfer_request(25_000_000);

        // consistent txID, but the node pays someone else
        let mut swapped = request.clone();
        swapped.destination = address::encode_base58(&[address::ADDRESS_PREFIX; address::ADDRESS_LEN]);
        let unsigned = unsigned_transfer(&hex::encode(raw_transfer(&swapped, 0, 1)));
        assert!(matches!(
            signer.sign(&request, &unsigned),
            Err(SignerError::Transaction(TransactionError::Mismatch { field: "destination", .. }))
        ));

        // opaque bytes that are not a transfer at all
        let unsigned = unsigned_transfer("0a02cafe2208deadbeef");
        assert!(matches!(
            signer.sign(&request, &unsigned),
            Err(SignerError::Transaction(_))
        ));
    }
}
