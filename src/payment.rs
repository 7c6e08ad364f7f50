//! x402 payment protocol types.
//!
//! A paid endpoint answers an unpaid request with `402 Payment Required` and a
//! challenge listing the payments it accepts. Version 1 servers put the
//! challenge in the JSON body, version 2 servers in a base64 `PAYMENT-REQUIRED`
//! header. The client answers by resending the request with a signed
//! [`PaymentPayload`] in `X-PAYMENT` (v1) or `PAYMENT-SIGNATURE` (v2).

use crate::error::Error;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// The only scheme this client can pay: EIP-3009 transfer of an exact amount.
pub const EXACT_SCHEME: &str = "exact";

/// Challenge header used by version 2 servers.
pub const PAYMENT_REQUIRED_HEADER: &str = "payment-required";
/// Payment header for version 1 challenges.
pub const X_PAYMENT_HEADER: &str = "x-payment";
/// Payment header for version 2 challenges.
pub const PAYMENT_SIGNATURE_HEADER: &str = "payment-signature";
/// Settlement receipt headers, v1 then v2.
pub const RECEIPT_HEADERS: [&str; 2] = ["x-payment-response", "payment-response"];

/// Default validity window when a requirement does not state one.
const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// EVM chain id for an x402 network name.
pub fn chain_id(network: &str) -> Option<u64> {
    match network {
        "base" => Some(8453),
        "base-sepolia" => Some(84532),
        "avalanche" => Some(43114),
        "avalanche-fuji" => Some(43113),
        other => other.strip_prefix("eip155:")?.parse().ok(),
    }
}

/// USDC's EIP-712 domain name on a chain.
pub fn default_token_name(chain_id: u64) -> &'static str {
    match chain_id {
        84532 | 43113 => "USDC",
        _ => "USD Coin",
    }
}

/// One way of paying that the server accepts.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    /// Amount in atomic token units, as a decimal string.
    #[serde(default)]
    pub max_amount_required: String,
    /// Version 2 name of the amount; folded into `max_amount_required`.
    #[serde(default)]
    pub amount: Option<String>,
    /// Token contract address.
    pub asset: String,
    pub pay_to: String,
    #[serde(default)]
    pub max_timeout_seconds: u64,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Scheme specific data; for `exact` the EIP-712 domain `name` and `version`.
    #[serde(default)]
    pub extra: Option<Value>,
    /// The requirement exactly as the server sent it.
    #[serde(skip)]
    pub raw: Value,
}

impl PaymentRequirements {
    /// Amount in atomic units.
    pub fn amount(&self) -> Result<u128, Error> {
        self.max_amount_required.parse().map_err(|_| {
            Error::InvalidChallenge(format!("invalid amount: {}", self.max_amount_required))
        })
    }

    /// Seconds the authorization stays valid.
    pub fn timeout_seconds(&self) -> u64 {
        if self.max_timeout_seconds == 0 {
            DEFAULT_TIMEOUT_SECONDS
        } else {
            self.max_timeout_seconds
        }
    }

    /// String field of `extra`, if present.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.as_ref()?.get(key)?.as_str()
    }
}

/// Decoded `402 Payment Required` challenge.
#[derive(Debug, Clone)]
pub struct PaymentChallenge {
    pub x402_version: u32,
    pub error: Option<String>,
    /// Resource description (v2 only).
    pub resource: Option<Value>,
    pub accepts: Vec<PaymentRequirements>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChallenge {
    x402_version: u32,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    resource: Option<Value>,
    #[serde(default)]
    accepts: Vec<Value>,
}

impl PaymentChallenge {
    /// Parse a challenge from a JSON document.
    pub fn from_json(data: &[u8]) -> Result<Self, Error> {
        let raw: RawChallenge = serde_json::from_slice(data)
            .map_err(|e| Error::InvalidChallenge(e.to_string()))?;

        let accepts: Vec<PaymentRequirements> = raw
            .accepts
            .into_iter()
            .filter_map(|value| {
                match serde_json::from_value::<PaymentRequirements>(value.clone()) {
                    Ok(mut req) => {
                        if req.max_amount_required.is_empty() {
                            req.max_amount_required = req.amount.clone().unwrap_or_default();
                        }
                        if req.max_amount_required.is_empty() {
                            debug!("skipping payment requirement without an amount");
                            return None;
                        }
                        req.raw = value;
                        Some(req)
                    }
                    Err(e) => {
                        debug!(error = %e, "skipping unreadable payment requirement");
                        None
                    }
                }
            })
            .collect();

        if accepts.is_empty() {
            return Err(Error::InvalidChallenge(
                raw.error
                    .unwrap_or_else(|| "no payment requirements offered".to_string()),
            ));
        }

        Ok(Self {
            x402_version: raw.x402_version,
            error: raw.error,
            resource: raw.resource,
            accepts,
        })
    }

    /// Parse a challenge from a base64 `PAYMENT-REQUIRED` header.
    pub fn from_header(header: &str) -> Result<Self, Error> {
        let decoded = STANDARD
            .decode(header.trim())
            .map_err(|e| Error::InvalidChallenge(format!("header: {e}")))?;
        Self::from_json(&decoded)
    }

    /// Extract the challenge from a 402 response. The header wins over the body.
    pub async fn from_response(resp: reqwest::Response) -> Result<Self, Error> {
        if let Some(header) = resp.headers().get(PAYMENT_REQUIRED_HEADER) {
            let header = header
                .to_str()
                .map_err(|e| Error::InvalidChallenge(format!("header: {e}")))?;
            return Self::from_header(header);
        }
        let body = resp.bytes().await.map_err(Error::from_transport)?;
        Self::from_json(&body)
    }

    /// Pick the first requirement this client can pay within `max_amount`.
    pub fn select(&self, max_amount: u128) -> Result<&PaymentRequirements, Error> {
        let mut over_limit = None;

        for req in &self.accepts {
            if req.scheme != EXACT_SCHEME || chain_id(&req.network).is_none() {
                continue;
            }
            let Ok(amount) = req.amount() else {
                continue;
            };
            if amount > max_amount {
                over_limit.get_or_insert(amount);
                continue;
            }
            return Ok(req);
        }

        Err(match over_limit {
            Some(amount) => Error::PaymentLimit {
                amount,
                max: max_amount,
            },
            None => {
                let offered: Vec<String> = self
                    .accepts
                    .iter()
                    .map(|r| format!("{}/{}", r.scheme, r.network))
                    .collect();
                Error::UnsupportedPayment(format!("offered: {}", offered.join(", ")))
            }
        })
    }

    /// Request header that carries the payment for this challenge's version.
    pub fn payment_header(&self) -> &'static str {
        if self.x402_version >= 2 {
            PAYMENT_SIGNATURE_HEADER
        } else {
            X_PAYMENT_HEADER
        }
    }
}

/// EIP-3009 `TransferWithAuthorization` parameters, all as strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip3009Authorization {
    pub from: String,
    pub to: String,
    pub value: String,
    pub valid_after: String,
    pub valid_before: String,
    pub nonce: String,
}

/// Signature plus the authorization it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExactEvmPayload {
    pub signature: String,
    pub authorization: Eip3009Authorization,
}

/// Payment sent with the retried request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Selected requirement echoed back verbatim (v2).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    pub payload: ExactEvmPayload,
}

impl PaymentPayload {
    /// Shape a signed payload for the challenge's protocol version.
    pub fn for_challenge(
        challenge: &PaymentChallenge,
        requirements: &PaymentRequirements,
        payload: ExactEvmPayload,
    ) -> Self {
        if challenge.x402_version >= 2 {
            Self {
                x402_version: challenge.x402_version,
                scheme: None,
                network: None,
                accepted: Some(requirements.raw.clone()),
                resource: challenge.resource.clone(),
                payload,
            }
        } else {
            Self {
                x402_version: challenge.x402_version,
                scheme: Some(requirements.scheme.clone()),
                network: Some(requirements.network.clone()),
                accepted: None,
                resource: None,
                payload,
            }
        }
    }

    /// Encode as base64 JSON for the payment header.
    pub fn to_header(&self) -> Result<String, Error> {
        let json = serde_json::to_string(self)
            .map_err(|e| Error::Signing(format!("encoding payment payload: {e}")))?;
        Ok(STANDARD.encode(json))
    }

    /// Decode a payment header.
    pub fn from_header(header: &str) -> Result<Self, Error> {
        let decoded = STANDARD
            .decode(header.trim())
            .map_err(|e| Error::parse(e.to_string()))?;
        serde_json::from_slice(&decoded).map_err(|e| Error::parse(e.to_string()))
    }
}

/// Settlement result returned by the server after a paid request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub success: bool,
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub payer: Option<String>,
    #[serde(default)]
    pub error_reason: Option<String>,
}

impl PaymentReceipt {
    /// Decode the receipt header, if the response carries a readable one.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = RECEIPT_HEADERS
            .iter()
            .find_map(|name| headers.get(*name))?
            .to_str()
            .ok()?;

        let decoded = STANDARD.decode(value.trim()).ok()?;
        match serde_json::from_slice(&decoded) {
            Ok(receipt) => Some(receipt),
            Err(e) => {
                debug!(error = %e, "ignoring unreadable payment receipt");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn v1_challenge(amount: &str) -> Vec<u8> {
        serde_json::json!({
            "x402Version": 1,
            "error": "X-PAYMENT header is required",
            "accepts": [{
                "scheme": "exact",
                "network": "base",
                "maxAmountRequired": amount,
                "resource": "https://jatevo.ai/api/x402/llm/qwen",
                "description": "LLM completion",
                "mimeType": "application/json",
                "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
                "maxTimeoutSeconds": 300,
                "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
                "extra": {"name": "USD Coin", "version": "2"}
            }]
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_parse_v1_body() {
        let challenge = PaymentChallenge::from_json(&v1_challenge("10000")).unwrap();
        assert_eq!(challenge.x402_version, 1);
        assert_eq!(challenge.accepts.len(), 1);

        let req = &challenge.accepts[0];
        assert_eq!(req.amount().unwrap(), 10_000);
        assert_eq!(req.timeout_seconds(), 300);
        assert_eq!(req.extra_str("name"), Some("USD Coin"));
        assert_eq!(req.raw["mimeType"], "application/json");
        assert_eq!(challenge.payment_header(), X_PAYMENT_HEADER);
    }

    #[test]
    fn test_parse_v2_header() {
        let json = serde_json::json!({
            "x402Version": 2,
            "resource": {"url": "https://jatevo.ai/api/x402/llm/kimi"},
            "accepts": [{
                "scheme": "exact",
                "network": "eip155:8453",
                "amount": "10000",
                "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
                "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
                "maxTimeoutSeconds": 60
            }]
        });
        let header = STANDARD.encode(json.to_string());

        let challenge = PaymentChallenge::from_header(&header).unwrap();
        assert_eq!(challenge.x402_version, 2);
        assert_eq!(challenge.accepts[0].max_amount_required, "10000");
        assert_eq!(challenge.payment_header(), PAYMENT_SIGNATURE_HEADER);
        assert!(challenge.resource.is_some());
    }

    #[test]
    fn test_amount_field_names() {
        let json = serde_json::json!({
            "x402Version": 2,
            "accepts": [
                {"scheme": "exact", "network": "base", "amount": "7000",
                 "maxAmountRequired": "7000", "payTo": "x", "asset": "y"},
                {"scheme": "exact", "network": "base", "payTo": "x", "asset": "y"}
            ]
        });
        let challenge = PaymentChallenge::from_json(json.to_string().as_bytes()).unwrap();
        assert_eq!(challenge.accepts.len(), 1);
        assert_eq!(challenge.accepts[0].amount().unwrap(), 7000);
        assert_eq!(challenge.select(100_000).unwrap().network, "base");
    }

    #[test]
    fn test_invalid_challenges() {
        assert!(matches!(
            PaymentChallenge::from_json(b"not json"),
            Err(Error::InvalidChallenge(_))
        ));
        assert!(matches!(
            PaymentChallenge::from_json(br#"{"x402Version":1,"accepts":[]}"#),
            Err(Error::InvalidChallenge(_))
        ));
        assert!(PaymentChallenge::from_header("%%%").is_err());
    }

    #[test]
    fn test_select_within_limit() {
        let challenge = PaymentChallenge::from_json(&v1_challenge("10000")).unwrap();
        let req = challenge.select(100_000).unwrap();
        assert_eq!(req.network, "base");
    }

    #[test]
    fn test_select_over_limit() {
        let challenge = PaymentChallenge::from_json(&v1_challenge("1000000")).unwrap();
        match challenge.select(100_000) {
            Err(Error::PaymentLimit { amount, max }) => {
                assert_eq!(amount, 1_000_000);
                assert_eq!(max, 100_000);
            }
            other => panic!("expected limit error, got {other:?}"),
        }
    }

    #[test]
    fn test_select_skips_unknown_schemes() {
        let json = serde_json::json!({
            "x402Version": 1,
            "accepts": [
                {"scheme": "exact", "network": "solana", "maxAmountRequired": "1",
                 "payTo": "x", "asset": "y"},
                {"scheme": "upto", "network": "base", "maxAmountRequired": "1",
                 "payTo": "x", "asset": "y"}
            ]
        });
        let challenge = PaymentChallenge::from_json(json.to_string().as_bytes()).unwrap();
        let err = challenge.select(100_000).unwrap_err();
        assert!(matches!(err, Error::UnsupportedPayment(_)));
        assert!(err.is_payment());
    }

    #[test]
    fn test_networks() {
        assert_eq!(chain_id("base"), Some(8453));
        assert_eq!(chain_id("base-sepolia"), Some(84532));
        assert_eq!(chain_id("eip155:137"), Some(137));
        assert_eq!(chain_id("eip155:abc"), None);
        assert_eq!(chain_id("solana"), None);
        assert_eq!(default_token_name(84532), "USDC");
        assert_eq!(default_token_name(8453), "USD Coin");
    }

    #[test]
    fn test_payload_shape_by_version() {
        let challenge = PaymentChallenge::from_json(&v1_challenge("10000")).unwrap();
        let payload = ExactEvmPayload {
            signature: "0xabc".into(),
            authorization: Eip3009Authorization {
                from: "0x1".into(),
                to: "0x2".into(),
                value: "10000".into(),
                valid_after: "0".into(),
                valid_before: "100".into(),
                nonce: "0x3".into(),
            },
        };

        let v1 = PaymentPayload::for_challenge(&challenge, &challenge.accepts[0], payload.clone());
        let json = serde_json::to_value(&v1).unwrap();
        assert_eq!(json["x402Version"], 1);
        assert_eq!(json["scheme"], "exact");
        assert_eq!(json["payload"]["authorization"]["validBefore"], "100");
        assert!(json.get("accepted").is_none());

        let mut v2_challenge = challenge.clone();
        v2_challenge.x402_version = 2;
        let v2 = PaymentPayload::for_challenge(&v2_challenge, &challenge.accepts[0], payload);
        let json = serde_json::to_value(&v2).unwrap();
        assert!(json.get("scheme").is_none());
        assert_eq!(json["accepted"]["maxAmountRequired"], "10000");

        let decoded = PaymentPayload::from_header(&v2.to_header().unwrap()).unwrap();
        assert_eq!(decoded.payload, v2.payload);
    }

    #[test]
    fn test_receipt_from_headers() {
        let receipt = serde_json::json!({
            "success": true,
            "transaction": "0xdeadbeef",
            "network": "base",
            "payer": "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
        });
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-payment-response",
            HeaderValue::from_str(&STANDARD.encode(receipt.to_string())).unwrap(),
        );

        let parsed = PaymentReceipt::from_headers(&headers).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.transaction.as_deref(), Some("0xdeadbeef"));

        headers.insert("x-payment-response", HeaderValue::from_static("garbage"));
        assert!(PaymentReceipt::from_headers(&headers).is_none());
        assert!(PaymentReceipt::from_headers(&HeaderMap::new()).is_none());
    }
}
