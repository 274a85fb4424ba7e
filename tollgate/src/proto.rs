//! Wire format types for x402 payment gating.
//!
//! These are the messages exchanged with paying clients (the 402 body) and
//! with the remote facilitator (verify and settle). Field names follow the
//! x402 version 1 JSON layout.
//!
//! # Key Types
//!
//! - [`PriceTag`] - Static payment terms configured for a gated service
//! - [`PaymentRequirements`] - Terms for one concrete resource URL
//! - [`PaymentRequired`] - HTTP 402 response body
//! - [`PaymentProof`] - Opaque client-supplied proof decoded from the payment header
//! - [`VerifyRequest`] / [`VerifyResponse`] / [`SettleResponse`] - Facilitator messages

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::amount::TokenAmount;

/// Protocol version carried in every x402 message produced here.
pub const X402_VERSION: u32 = 1;

/// A unit struct representing the string literal `"exact"`.
///
/// This is the only scheme the gateway charges with: the caller pays exactly
/// the advertised amount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExactScheme;

impl ExactScheme {
    /// The string literal value: `"exact"`.
    pub const VALUE: &'static str = "exact";
}

impl fmt::Display for ExactScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::VALUE)
    }
}

impl Serialize for ExactScheme {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for ExactScheme {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == Self::VALUE {
            Ok(Self)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported scheme {s:?}, expected \"exact\""
            )))
        }
    }
}

/// Asset metadata required for off-chain signature verification
/// (the EIP-712 domain `name` and `version` of the token contract).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetExtra {
    /// Token domain name (e.g. `"USD Coin"`).
    pub name: String,
    /// Token domain version (e.g. `"2"`).
    pub version: String,
}

/// Payment terms for a single resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// The payment scheme, always `"exact"`.
    pub scheme: ExactScheme,
    /// Network identifier (e.g. `"base"` or `"base-sepolia"`).
    pub network: String,
    /// Required amount in the asset's smallest unit.
    pub max_amount_required: TokenAmount,
    /// Full URL of the resource being charged for.
    pub resource: String,
    /// Human-readable description of the resource.
    #[serde(default)]
    pub description: String,
    /// MIME type of the resource.
    #[serde(default)]
    pub mime_type: String,
    /// Payee address.
    pub pay_to: String,
    /// Maximum time in seconds the payment authorization stays valid.
    pub max_timeout_seconds: u64,
    /// Asset contract address.
    pub asset: String,
    /// Asset metadata for signature verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<AssetExtra>,
}

/// Static payment terms for a gated service.
///
/// A price tag turns into concrete [`PaymentRequirements`] once the resource
/// URL of a request is known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PriceTag {
    /// Network identifier.
    pub network: String,
    /// Payee address.
    pub pay_to: String,
    /// Amount charged per call, in the asset's smallest unit.
    pub amount: TokenAmount,
    /// Asset contract address.
    pub asset: String,
    /// Asset metadata for signature verification.
    pub asset_extra: Option<AssetExtra>,
    /// Authorization timeout in seconds.
    pub max_timeout_seconds: u64,
    /// Description advertised in 402 responses.
    pub description: String,
    /// MIME type advertised in 402 responses.
    pub mime_type: String,
}

impl PriceTag {
    /// Default authorization timeout, in seconds.
    pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

    /// Creates a price tag with the default timeout and no asset metadata.
    #[must_use]
    pub fn new(
        network: impl Into<String>,
        pay_to: impl Into<String>,
        amount: TokenAmount,
        asset: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            pay_to: pay_to.into(),
            amount,
            asset: asset.into(),
            asset_extra: None,
            max_timeout_seconds: Self::DEFAULT_TIMEOUT_SECONDS,
            description: String::new(),
            mime_type: String::new(),
        }
    }

    /// Sets the asset metadata (`name` and `version`).
    #[must_use]
    pub fn with_asset_extra(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.asset_extra = Some(AssetExtra {
            name: name.into(),
            version: version.into(),
        });
        self
    }

    /// Sets the authorization timeout.
    #[must_use]
    pub const fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.max_timeout_seconds = seconds;
        self
    }

    /// Sets the description advertised to payers.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builds the requirements for one concrete resource URL.
    #[must_use]
    pub fn requirements_for(&self, resource: impl Into<String>) -> PaymentRequirements {
        PaymentRequirements {
            scheme: ExactScheme,
            network: self.network.clone(),
            max_amount_required: self.amount,
            resource: resource.into(),
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
            pay_to: self.pay_to.clone(),
            max_timeout_seconds: self.max_timeout_seconds,
            asset: self.asset.clone(),
            extra: self.asset_extra.clone(),
        }
    }
}

/// HTTP 402 response body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    /// Protocol version.
    pub x402_version: u32,
    /// Why the request was rejected.
    pub error: String,
    /// Accepted payment options (exactly one here).
    pub accepts: Vec<PaymentRequirements>,
}

impl PaymentRequired {
    /// Builds a rejection advertising a single set of requirements.
    #[must_use]
    pub fn new(error: impl Into<String>, requirements: PaymentRequirements) -> Self {
        Self {
            x402_version: X402_VERSION,
            error: error.into(),
            accepts: vec![requirements],
        }
    }
}

/// A client-supplied payment proof.
///
/// The gateway never interprets the proof itself: it is forwarded verbatim to
/// the facilitator. Decoding only checks that the header carries JSON, either
/// raw or base64-encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentProof {
    payload: serde_json::Value,
}

impl PaymentProof {
    /// Decodes a payment header value.
    ///
    /// Returns `None` if the value is neither a JSON object nor base64 of one.
    #[must_use]
    pub fn decode(header: &[u8]) -> Option<Self> {
        let trimmed = header.trim_ascii();
        if trimmed.is_empty() {
            return None;
        }
        let payload = serde_json::from_slice::<serde_json::Value>(trimmed)
            .ok()
            .or_else(|| {
                let decoded = BASE64_STANDARD.decode(trimmed).ok()?;
                serde_json::from_slice(&decoded).ok()
            })?;
        payload.is_object().then_some(Self { payload })
    }

    /// Returns the decoded JSON payload.
    #[must_use]
    pub const fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

impl From<serde_json::Value> for PaymentProof {
    fn from(payload: serde_json::Value) -> Self {
        Self { payload }
    }
}

/// Body of a facilitator `verify` or `settle` call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// Protocol version.
    pub x402_version: u32,
    /// The proof exactly as the client sent it.
    pub payment_payload: serde_json::Value,
    /// Requirements the proof must satisfy.
    pub payment_requirements: PaymentRequirements,
}

/// Settlement uses the same body as verification.
pub type SettleRequest = VerifyRequest;

impl VerifyRequest {
    /// Builds a request for the given proof and requirements.
    #[must_use]
    pub fn new(proof: &PaymentProof, requirements: &PaymentRequirements) -> Self {
        Self {
            x402_version: X402_VERSION,
            payment_payload: proof.payload.clone(),
            payment_requirements: requirements.clone(),
        }
    }
}

/// Result of a facilitator `verify` call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    /// Whether the proof satisfies the requirements.
    pub is_valid: bool,
    /// Facilitator-provided reason when invalid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    /// Address of the payer, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

impl VerifyResponse {
    /// A successful verification.
    #[must_use]
    pub fn valid(payer: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            invalid_reason: None,
            payer: Some(payer.into()),
        }
    }

    /// A failed verification with a reason.
    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            invalid_reason: Some(reason.into()),
            payer: None,
        }
    }
}

/// Result of a facilitator `settle` call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    /// Whether the payment was settled on-chain.
    pub success: bool,
    /// Facilitator-provided reason when settlement failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    /// Settlement transaction hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    /// Network the payment settled on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Address of the payer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn price_tag() -> PriceTag {
        PriceTag::new(
            "base-sepolia",
            "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
            TokenAmount::new(10_000),
            "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
        )
        .with_asset_extra("USDC", "2")
    }

    #[test]
    fn requirements_serialize_with_x402_field_names() {
        let requirements = price_tag().requirements_for("https://tools.example.com/mcp");
        let value = serde_json::to_value(&requirements).unwrap();
        assert_eq!(value["scheme"], "exact");
        assert_eq!(value["network"], "base-sepolia");
        assert_eq!(value["maxAmountRequired"], "10000");
        assert_eq!(value["resource"], "https://tools.example.com/mcp");
        assert_eq!(value["payTo"], "0x209693Bc6afc0C5328bA36FaF03C514EF312287C");
        assert_eq!(value["maxTimeoutSeconds"], 300);
        assert_eq!(value["extra"], json!({"name": "USDC", "version": "2"}));
    }

    #[test]
    fn payment_required_carries_single_accept() {
        let body = PaymentRequired::new(
            "X-PAYMENT header is required",
            price_tag().requirements_for("https://a/mcp"),
        );
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["x402Version"], 1);
        assert_eq!(value["accepts"].as_array().unwrap().len(), 1);
        assert_eq!(value["accepts"][0]["resource"], "https://a/mcp");
    }

    #[test]
    fn proof_decodes_raw_json() {
        let proof = PaymentProof::decode(br#"{"x402Version":1,"payload":{"signature":"0x1"}}"#);
        assert_eq!(proof.unwrap().payload()["payload"]["signature"], "0x1");
    }

    #[test]
    fn proof_decodes_base64_json() {
        let encoded = BASE64_STANDARD.encode(br#"{"scheme":"exact"}"#);
        let proof = PaymentProof::decode(encoded.as_bytes()).unwrap();
        assert_eq!(proof.payload()["scheme"], "exact");
    }

    #[test]
    fn proof_rejects_garbage_and_non_objects() {
        assert!(PaymentProof::decode(b"invalid{json").is_none());
        assert!(PaymentProof::decode(b"   ").is_none());
        assert!(PaymentProof::decode(b"[1,2]").is_none());
        assert!(PaymentProof::decode(b"42").is_none());
    }

    #[test]
    fn verify_response_defaults_optional_fields() {
        let response: VerifyResponse = serde_json::from_str(r#"{"isValid":false}"#).unwrap();
        assert!(!response.is_valid);
        assert!(response.invalid_reason.is_none());
    }

    #[test]
    fn scheme_rejects_unknown_values() {
        assert!(serde_json::from_str::<ExactScheme>("\"upto\"").is_err());
        assert_eq!(serde_json::from_str::<ExactScheme>("\"exact\"").unwrap(), ExactScheme);
    }
}
