use thiserror::Error;

/// Boxed error produced by the underlying byte stream.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type for paid requests.
#[derive(Error, Debug)]
pub enum Error {
    /// No credential was supplied to the client builder.
    #[error("missing payment credential")]
    MissingCredential,

    /// Invalid configuration (base URL, private key, HTTP client).
    #[error("config: {0}")]
    Config(String),

    /// The request after payment authorization still failed.
    #[error("payment rejected ({status}): {body}")]
    Payment { status: u16, body: String },

    /// The 402 response did not carry a usable challenge.
    #[error("invalid payment challenge: {0}")]
    InvalidChallenge(String),

    /// None of the offered payment requirements can be satisfied.
    #[error("unsupported payment: {0}")]
    UnsupportedPayment(String),

    /// The requested amount exceeds the configured limit.
    #[error("payment of {amount} exceeds limit of {max} atomic units")]
    PaymentLimit { amount: u128, max: u128 },

    /// Producing the payment authorization failed.
    #[error("signing: {0}")]
    Signing(String),

    /// Non-success status on the unpaid request.
    #[error("api error ({status}): {body}")]
    Api { status: u16, body: String },

    /// Request or connection timeout.
    #[error("timeout")]
    Timeout,

    /// Response body could not be parsed.
    #[error("parse: {0}")]
    Parse(String),

    /// HTTP/network error.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// Connection failed while a streamed body was being read.
    #[error("stream: {0}")]
    Stream(#[source] BoxError),
}

impl Error {
    /// Returns true if the failure belongs to the payment flow.
    #[inline]
    pub fn is_payment(&self) -> bool {
        matches!(
            self,
            Error::Payment { .. }
                | Error::InvalidChallenge(_)
                | Error::UnsupportedPayment(_)
                | Error::PaymentLimit { .. }
                | Error::Signing(_)
        )
    }

    /// Returns true for network-level failures.
    #[inline]
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Timeout | Error::Stream(_))
    }

    /// Returns true for configuration errors raised before any I/O.
    #[inline]
    pub fn is_config(&self) -> bool {
        matches!(self, Error::MissingCredential | Error::Config(_))
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Payment { status, .. } | Error::Api { status, .. } => Some(*status),
            Error::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Create a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Map a reqwest error, folding timeouts into [`Error::Timeout`].
    pub(crate) fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Http(e)
        }
    }
}
