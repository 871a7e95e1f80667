//! Callback validator (C7): typed parsing and validation of MPC result
//! payloads (spec Sec 4.7). Every callback shares a common envelope
//! (`request_id`, `signature`, `timestamp`, `cluster_offset`, optional
//! `error`); the payload itself is tagged by a string discriminator.

use crate::error::{CrankError, CrankResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "result", rename_all = "snake_case")]
pub enum CallbackPayload {
    ComparePrices { price_a: String, price_b: String, is_favorable: bool },
    CalculateFill { fill_amount: String, fill_value: String },
    CheckLiquidation { is_liquidatable: bool, margin_ratio: String },
    CalculateMarginRatio { margin_ratio: String },
    CalculatePnl { pnl: String },
    CalculateFunding { funding_rate: String, funding_amount: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCallback {
    pub request_id: String,
    pub signature: String,
    pub timestamp: u64,
    pub cluster_offset: i64,
    pub error: Option<CallbackError>,
    #[serde(flatten)]
    pub payload: Option<CallbackPayload>,
}

/// A validated callback: request id and signature decoded to bytes,
/// numeric fields range-checked, arbitrary-precision values kept as
/// strings rather than coerced to machine floats.
#[derive(Debug, Clone)]
pub struct ValidatedCallback {
    pub request_id: [u8; 32],
    pub signature: Vec<u8>,
    pub timestamp: u64,
    pub cluster_offset: u64,
    pub error: Option<CallbackError>,
    pub payload: CallbackPayload,
}

/// Verifies an MPC callback signature. In development this always accepts;
/// in production there is no default backend -- spec Sec 9 leaves key
/// verification as an open question operators must resolve themselves, so
/// this refuses to claim a signature is valid until one is wired in.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, request_id: &[u8; 32], signature: &[u8]) -> bool;
}

pub struct DevSignatureVerifier;

impl SignatureVerifier for DevSignatureVerifier {
    fn verify(&self, _request_id: &[u8; 32], _signature: &[u8]) -> bool {
        true
    }
}

/// Refuses every signature: the safe default for production until a real
/// verification backend is configured (see DESIGN.md for the decision).
pub struct UnconfiguredSignatureVerifier;

impl SignatureVerifier for UnconfiguredSignatureVerifier {
    fn verify(&self, _request_id: &[u8; 32], _signature: &[u8]) -> bool {
        false
    }
}

pub struct CallbackValidator<V: SignatureVerifier> {
    verifier: V,
}

impl<V: SignatureVerifier> CallbackValidator<V> {
    pub fn new(verifier: V) -> Self {
        Self { verifier }
    }

    pub fn validate(&self, raw: RawCallback) -> CrankResult<ValidatedCallback> {
        let request_id_bytes = hex::decode(&raw.request_id)
            .map_err(|_| CrankError::validation(1, "request_id is not valid hex"))?;
        let request_id: [u8; 32] = request_id_bytes
            .try_into()
            .map_err(|_| CrankError::validation(2, "request_id must be 32 bytes"))?;

        let signature = hex::decode(&raw.signature)
            .map_err(|_| CrankError::validation(3, "signature is not valid hex"))?;
        if signature.len() < 32 {
            return Err(CrankError::validation(4, "signature must be at least 32 bytes"));
        }

        if raw.cluster_offset < 0 {
            return Err(CrankError::validation(5, "cluster_offset must not be negative"));
        }
        let cluster_offset = raw.cluster_offset as u64;

        let payload = raw
            .payload
            .ok_or_else(|| CrankError::validation(6, "unknown or missing callback payload type"))?;
        validate_payload(&payload)?;

        if !self.verifier.verify(&request_id, &signature) {
            return Err(CrankError::mpc(1, "MpcSignatureInvalid").severity(crate::error::Severity::Critical));
        }

        Ok(ValidatedCallback {
            request_id,
            signature,
            timestamp: raw.timestamp,
            cluster_offset,
            error: raw.error,
            payload,
        })
    }
}

fn validate_payload(payload: &CallbackPayload) -> CrankResult<()> {
    match payload {
        CallbackPayload::CalculateFill { fill_amount, fill_value } => {
            let amount: i128 = fill_amount
                .parse()
                .map_err(|_| CrankError::validation(10, "fillAmount is not an integer"))?;
            if amount <= 0 {
                return Err(CrankError::validation(11, "fillAmount must be positive"));
            }
            let value: i128 = fill_value
                .parse()
                .map_err(|_| CrankError::validation(12, "fillValue is not an integer"))?;
            if value < 0 {
                return Err(CrankError::validation(13, "fillValue must not be negative"));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Validates the `encryptedFillAmount` / `requestId` byte-length
/// constraints carried by on-chain match events (spec Sec 4.7): the
/// encrypted amount must be exactly 64 bytes, the event's request id
/// exactly 32.
pub fn validate_encrypted_fill_amount(bytes: &[u8]) -> CrankResult<()> {
    if bytes.len() != 64 {
        return Err(CrankError::validation(
            20,
            format!("encryptedFillAmount must be 64 bytes, got {}", bytes.len()),
        ));
    }
    Ok(())
}

pub fn validate_event_request_id(bytes: &[u8]) -> CrankResult<()> {
    if bytes.len() != 32 {
        return Err(CrankError::validation(
            21,
            format!("requestId must be 32 bytes, got {}", bytes.len()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(payload_json: &str) -> RawCallback {
        let request_id = hex::encode([1u8; 32]);
        let signature = hex::encode([2u8; 32]);
        let full = format!(
            r#"{{"request_id":"{request_id}","signature":"{signature}","timestamp":1,"cluster_offset":0,{payload_json}}}"#
        );
        serde_json::from_str(&full).unwrap()
    }

    #[test]
    fn accepts_a_well_formed_calculate_fill_callback() {
        let validator = CallbackValidator::new(DevSignatureVerifier);
        let r = raw(r#""type":"calculate_fill","result":{"fill_amount":"100","fill_value":"5000"}"#);
        assert!(validator.validate(r).is_ok());
    }

    #[test]
    fn rejects_non_positive_fill_amount() {
        let validator = CallbackValidator::new(DevSignatureVerifier);
        let r = raw(r#""type":"calculate_fill","result":{"fill_amount":"0","fill_value":"5000"}"#);
        assert!(validator.validate(r).is_err());
    }

    #[test]
    fn rejects_negative_cluster_offset() {
        let request_id = hex::encode([1u8; 32]);
        let signature = hex::encode([2u8; 32]);
        let json = format!(
            r#"{{"request_id":"{request_id}","signature":"{signature}","timestamp":1,"cluster_offset":-1,"type":"calculate_fill","result":{{"fill_amount":"1","fill_value":"1"}}}}"#
        );
        let r: RawCallback = serde_json::from_str(&json).unwrap();
        let validator = CallbackValidator::new(DevSignatureVerifier);
        assert!(validator.validate(r).is_err());
    }

    #[test]
    fn unconfigured_production_verifier_refuses_every_signature() {
        let validator = CallbackValidator::new(UnconfiguredSignatureVerifier);
        let r = raw(r#""type":"calculate_fill","result":{"fill_amount":"1","fill_value":"1"}"#);
        assert!(validator.validate(r).is_err());
    }

    #[test]
    fn encrypted_fill_amount_must_be_64_bytes() {
        assert!(validate_encrypted_fill_amount(&[0u8; 64]).is_ok());
        assert!(validate_encrypted_fill_amount(&[0u8; 32]).is_err());
    }
}
