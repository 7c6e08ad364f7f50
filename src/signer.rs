//! Payment authorization signing.
//!
//! [`Credential`] signs an EIP-3009 `TransferWithAuthorization` over the
//! token's EIP-712 domain, which is what the `exact` EVM scheme expects.

use crate::error::Error;
use crate::payment::{
    chain_id, default_token_name, Eip3009Authorization, ExactEvmPayload, PaymentChallenge,
    PaymentPayload, PaymentRequirements,
};
use alloy::primitives::{Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use alloy::sol;
use alloy::sol_types::Eip712Domain;
use async_trait::async_trait;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds subtracted from `now` for `validAfter`, to absorb clock skew.
const VALID_AFTER_SKEW: u64 = 600;

sol! {
    #[derive(Debug)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

/// Produces payment authorizations for challenges.
#[async_trait]
pub trait PaymentSigner: Send + Sync {
    /// Address the payments are drawn from.
    fn address(&self) -> String;

    /// Sign a payment satisfying `requirements`, selected from `challenge`.
    async fn authorize(
        &self,
        challenge: &PaymentChallenge,
        requirements: &PaymentRequirements,
    ) -> Result<PaymentPayload, Error>;
}

/// Signing identity backed by a secp256k1 private key.
pub struct Credential {
    signer: PrivateKeySigner,
}

impl Credential {
    /// Create a credential from a hex private key, with or without `0x`.
    pub fn from_hex(private_key: &str) -> Result<Self, Error> {
        let signer = PrivateKeySigner::from_str(private_key.trim())
            .map_err(|e| Error::config(format!("invalid private key: {e}")))?;
        Ok(Self { signer })
    }

    /// EVM address of this credential.
    pub fn evm_address(&self) -> Address {
        self.signer.address()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("address", &self.signer.address())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PaymentSigner for Credential {
    fn address(&self) -> String {
        self.signer.address().to_string()
    }

    async fn authorize(
        &self,
        challenge: &PaymentChallenge,
        requirements: &PaymentRequirements,
    ) -> Result<PaymentPayload, Error> {
        let chain_id = chain_id(&requirements.network).ok_or_else(|| {
            Error::UnsupportedPayment(format!("unknown network {}", requirements.network))
        })?;
        let to: Address = requirements
            .pay_to
            .parse()
            .map_err(|e| Error::Signing(format!("invalid payTo address: {e}")))?;
        let asset: Address = requirements
            .asset
            .parse()
            .map_err(|e| Error::Signing(format!("invalid asset address: {e}")))?;
        let value = U256::from_str(&requirements.max_amount_required)
            .map_err(|e| Error::Signing(format!("invalid amount: {e}")))?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Signing(format!("clock: {e}")))?
            .as_secs();
        let valid_after = now.saturating_sub(VALID_AFTER_SKEW);
        let valid_before = now.checked_add(requirements.timeout_seconds()).ok_or_else(|| {
            Error::InvalidChallenge(format!(
                "maxTimeoutSeconds out of range: {}",
                requirements.max_timeout_seconds
            ))
        })?;
        let nonce = random_nonce();
        let from = self.signer.address();

        let auth = TransferWithAuthorization {
            from,
            to,
            value,
            validAfter: U256::from(valid_after),
            validBefore: U256::from(valid_before),
            nonce,
        };
        let domain = transfer_domain(requirements, chain_id, asset);

        let signature = self
            .signer
            .sign_typed_data(&auth, &domain)
            .await
            .map_err(|e| Error::Signing(e.to_string()))?;

        let payload = ExactEvmPayload {
            signature: format!("0x{}", hex::encode(signature.as_bytes())),
            authorization: Eip3009Authorization {
                from: from.to_string(),
                to: to.to_string(),
                value: value.to_string(),
                valid_after: valid_after.to_string(),
                valid_before: valid_before.to_string(),
                nonce: nonce.to_string(),
            },
        };
        Ok(PaymentPayload::for_challenge(challenge, requirements, payload))
    }
}

/// EIP-712 domain of the token contract named by `requirements`.
pub(crate) fn transfer_domain(
    requirements: &PaymentRequirements,
    chain_id: u64,
    asset: Address,
) -> Eip712Domain {
    let name = requirements
        .extra_str("name")
        .unwrap_or_else(|| default_token_name(chain_id))
        .to_string();
    let version = requirements.extra_str("version").unwrap_or("2").to_string();

    Eip712Domain::new(
        Some(name.into()),
        Some(version.into()),
        Some(U256::from(chain_id)),
        Some(asset),
        None,
    )
}

fn random_nonce() -> B256 {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    B256::from(bytes)
}
