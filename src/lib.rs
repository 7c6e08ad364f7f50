//! Pay-per-call LLM client with x402 micropayments and streaming responses.
//!
//! Requests that come back `402 Payment Required` are paid with a signed
//! USDC transfer authorization and sent again, once.
//!
//! # Example
//! ```no_run
//! use x402_llm::{Client, Credential, Message, Model};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), x402_llm::Error> {
//!     let credential = Credential::from_hex("0x...")?;
//!     let client = Client::new(credential)?;
//!
//!     let mut stream = client
//!         .chat(Model::Kimi.path(), vec![Message::user("Hello!")])
//!         .max_tokens(256)
//!         .stream()
//!         .await?;
//!
//!     while let Some(text) = stream.next().await {
//!         print!("{}", text?);
//!     }
//!
//!     println!("\nPaid: ${} USDC", client.spend().total());
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod payment;
pub mod signer;
pub mod spend;
pub mod sse;
pub mod stream;
pub mod types;

pub use client::{ChatRequestBuilder, Client, ClientBuilder, ClientConfig, PaidResponse};
pub use error::Error;
pub use payment::{PaymentChallenge, PaymentPayload, PaymentReceipt, PaymentRequirements};
pub use signer::{Credential, PaymentSigner};
pub use spend::{Amount, SpendTracker};
pub use stream::{ByteStream, TextStream};
pub use types::*;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
