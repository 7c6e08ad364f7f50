//! HTTP client with x402 payment handling and request builders.

use crate::error::Error;
use crate::payment::{PaymentChallenge, PaymentReceipt};
use crate::signer::{Credential, PaymentSigner};
use crate::spend::{Amount, SpendTracker};
use crate::stream::{ByteStream, TextStream};
use crate::types::{ChatRequest, Message};
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Host of the paid LLM API.
pub const DEFAULT_BASE_URL: &str = "https://jatevo.ai";

/// Client for a pay-per-call API.
///
/// Answers a `402 Payment Required` by signing the challenge with its
/// credential and resending the request once.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    signer: Arc<dyn PaymentSigner>,
    spend: Arc<Mutex<SpendTracker>>,
    config: ClientConfig,
}

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Bound on a whole buffered request, payment retry included.
    pub timeout: Duration,
    /// Bound on a whole streamed request, payment retry and body included.
    pub stream_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Largest payment the client will authorize, in atomic units.
    pub max_payment: u128,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            stream_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            // 0.10 USDC
            max_payment: 100_000,
        }
    }
}

/// Builder for Client.
pub struct ClientBuilder {
    base_url: String,
    signer: Option<Arc<dyn PaymentSigner>>,
    config: ClientConfig,
    http_builder: reqwest::ClientBuilder,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            signer: None,
            config: ClientConfig::default(),
            http_builder: reqwest::Client::builder().tcp_nodelay(true),
        }
    }

    /// Set the API host (useful for testing with mock servers).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Pay with a private key credential.
    pub fn credential(self, credential: Credential) -> Self {
        self.signer(credential)
    }

    /// Pay with any signer.
    pub fn signer(mut self, signer: impl PaymentSigner + 'static) -> Self {
        self.signer = Some(Arc::new(signer));
        self
    }

    /// Set the buffered request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the streaming request timeout.
    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream_timeout = timeout;
        self
    }

    /// Set the largest payment to authorize, in atomic units.
    pub fn max_payment(mut self, atomic: u128) -> Self {
        self.config.max_payment = atomic;
        self
    }

    /// Build the client. Fails without a credential.
    pub fn build(self) -> Result<Client, Error> {
        let signer = self.signer.ok_or(Error::MissingCredential)?;

        reqwest::Url::parse(&self.base_url)
            .map_err(|e| Error::config(format!("invalid base url {}: {e}", self.base_url)))?;

        let http = self
            .http_builder
            .connect_timeout(self.config.connect_timeout)
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        debug!(address = %signer.address(), base_url = %self.base_url, "client ready");

        Ok(Client {
            http,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            signer,
            spend: Arc::new(Mutex::new(SpendTracker::new())),
            config: self.config,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffered response of a possibly paid request.
#[derive(Debug, Clone)]
pub struct PaidResponse {
    /// Response body, unchanged.
    pub body: Value,
    /// Settlement receipt, if the server sent one.
    pub receipt: Option<PaymentReceipt>,
    /// Amount authorized, if a payment was made.
    pub amount_paid: Option<Amount>,
}

/// Successful response plus what it cost.
struct Settled {
    response: reqwest::Response,
    receipt: Option<PaymentReceipt>,
    amount_paid: Option<Amount>,
}

/// Payment progress of one logical request.
enum PaymentState {
    Unpaid,
    Challenged(PaymentChallenge),
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create a client for the default host paying with `credential`.
    pub fn new(credential: Credential) -> Result<Self, Error> {
        ClientBuilder::new().credential(credential).build()
    }

    /// Address payments are drawn from.
    pub fn address(&self) -> String {
        self.signer.address()
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Snapshot of payments made by this client and its clones.
    pub fn spend(&self) -> SpendTracker {
        self.spend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start building a chat completion request.
    pub fn chat(&self, path: impl Into<String>, messages: Vec<Message>) -> ChatRequestBuilder<'_> {
        ChatRequestBuilder {
            client: self,
            path: path.into(),
            request: ChatRequest::new(messages),
        }
    }

    /// POST `body` to `path` and return the JSON response body.
    pub async fn request<B>(&self, path: &str, body: &B) -> Result<Value, Error>
    where
        B: Serialize + ?Sized,
    {
        self.request_with_receipt(path, body)
            .await
            .map(|paid| paid.body)
    }

    /// Like [`Client::request`], also returning what was paid.
    pub async fn request_with_receipt<B>(&self, path: &str, body: &B) -> Result<PaidResponse, Error>
    where
        B: Serialize + ?Sized,
    {
        let body = to_json(body)?;
        let deadline = Instant::now() + self.config.timeout;

        let op = async {
            let settled = self.execute(path, &body, deadline).await?;
            let bytes = settled
                .response
                .bytes()
                .await
                .map_err(Error::from_transport)?;
            let body = serde_json::from_slice(&bytes).map_err(|e| Error::parse(e.to_string()))?;
            Ok::<_, Error>(PaidResponse {
                body,
                receipt: settled.receipt,
                amount_paid: settled.amount_paid,
            })
        };

        tokio::time::timeout_at(deadline, op)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// POST `body` to `path` and stream the text deltas of the response.
    pub async fn request_stream<B>(&self, path: &str, body: &B) -> Result<TextStream<ByteStream>, Error>
    where
        B: Serialize + ?Sized,
    {
        let body = to_json(body)?;
        let deadline = Instant::now() + self.config.stream_timeout;

        let settled = tokio::time::timeout_at(deadline, self.execute(path, &body, deadline))
            .await
            .map_err(|_| Error::Timeout)??;

        let bytes: ByteStream = settled.response.bytes_stream().boxed();
        Ok(TextStream::new(bytes)
            .with_payment(settled.receipt, settled.amount_paid)
            .with_deadline(deadline))
    }

    /// Send the request, paying at most once if challenged.
    async fn execute(&self, path: &str, body: &Value, deadline: Instant) -> Result<Settled, Error> {
        let url = self.url(path);
        let mut state = PaymentState::Unpaid;

        loop {
            state = match state {
                PaymentState::Unpaid => {
                    debug!(%url, "sending request");
                    let resp = self.post(&url, body, deadline, None).await?;
                    let status = resp.status();

                    if status == StatusCode::PAYMENT_REQUIRED {
                        PaymentState::Challenged(PaymentChallenge::from_response(resp).await?)
                    } else if status.is_success() {
                        return Ok(Settled {
                            response: resp,
                            receipt: None,
                            amount_paid: None,
                        });
                    } else {
                        return Err(api_error(resp).await);
                    }
                }
                // The paid attempt is final whatever its outcome
                PaymentState::Challenged(challenge) => {
                    return self.pay_and_retry(&url, body, deadline, &challenge).await;
                }
            };
        }
    }

    async fn pay_and_retry(
        &self,
        url: &str,
        body: &Value,
        deadline: Instant,
        challenge: &PaymentChallenge,
    ) -> Result<Settled, Error> {
        let requirements = challenge
            .select(self.config.max_payment)
            .inspect_err(|e| warn!(error = %e, "refusing payment challenge"))?;
        let amount = Amount::usdc(requirements.amount()?);

        info!(
            %amount,
            network = %requirements.network,
            pay_to = %requirements.pay_to,
            "payment required, authorizing"
        );

        let payment = self.signer.authorize(challenge, requirements).await?;
        let header = (challenge.payment_header(), payment.to_header()?);

        let resp = self.post(url, body, deadline, Some(header)).await?;
        let status = resp.status();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "paid request rejected");
            return Err(Error::Payment {
                status: status.as_u16(),
                body,
            });
        }

        let receipt = PaymentReceipt::from_headers(resp.headers());
        if let Some(tx) = receipt.as_ref().and_then(|r| r.transaction.as_deref()) {
            debug!(transaction = tx, "payment settled");
        }
        self.spend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(amount);

        Ok(Settled {
            response: resp,
            receipt,
            amount_paid: Some(amount),
        })
    }

    async fn post(
        &self,
        url: &str,
        body: &Value,
        deadline: Instant,
        payment: Option<(&'static str, String)>,
    ) -> Result<reqwest::Response, Error> {
        // Each round trip only gets what is left of the operation's budget
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout);
        }
        let mut req = self.http.post(url).timeout(remaining).json(body);
        if let Some((name, value)) = payment {
            req = req.header(name, value);
        }
        req.send().await.map_err(Error::from_transport)
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

fn to_json<B: Serialize + ?Sized>(body: &B) -> Result<Value, Error> {
    serde_json::to_value(body).map_err(|e| Error::parse(format!("request body: {e}")))
}

/// Convert a non-success, non-402 response to an error.
async fn api_error(resp: reqwest::Response) -> Error {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Error::Api { status, body }
}

/// Builder for chat completion requests.
pub struct ChatRequestBuilder<'a> {
    client: &'a Client,
    path: String,
    request: ChatRequest,
}

impl ChatRequestBuilder<'_> {
    /// Set temperature for sampling.
    pub fn temperature(mut self, temp: f32) -> Self {
        self.request.temperature = Some(temp);
        self
    }

    /// Set maximum tokens to generate.
    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.request.max_tokens = Some(tokens);
        self
    }

    /// Request body as it will be sent.
    pub fn body(&self) -> &ChatRequest {
        &self.request
    }

    /// Send as a buffered request.
    pub async fn send(self) -> Result<PaidResponse, Error> {
        self.client
            .request_with_receipt(&self.path, &self.request)
            .await
    }

    /// Send with `stream: true` and stream the text deltas.
    pub async fn stream(mut self) -> Result<TextStream<ByteStream>, Error> {
        self.request.stream = true;
        self.client.request_stream(&self.path, &self.request).await
    }
}
