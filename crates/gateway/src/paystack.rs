use hmac::{Hmac, Mac};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha512;
use subtle::ConstantTimeEq;
use thiserror::Error;
use url::Url;

/// Client for the Paystack transaction API.
#[derive(Clone)]
pub struct PaystackClient {
    http: Client,
    base_url: Url,
    secret_key: String,
}

impl PaystackClient {
    pub fn new(secret_key: impl Into<String>, base_url: &str, http: Client) -> Result<Self, PaystackError> {
        let base_url = if base_url.ends_with('/') {
            Url::parse(base_url)?
        } else {
            Url::parse(&format!("{base_url}/"))?
        };
        Ok(Self {
            http,
            base_url,
            secret_key: secret_key.into(),
        })
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    /// Starts a card checkout and returns the hosted payment page.
    pub async fn initialize(&self, request: &InitializeRequest) -> Result<InitializeData, PaystackError> {
        let url = self.base_url.join("transaction/initialize")?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.secret_key)
            .json(request)
            .send()
            .await?;

        parse_envelope(response).await
    }

    /// Looks up the authoritative state of a transaction by reference.
    pub async fn verify(&self, reference: &str) -> Result<Transaction, PaystackError> {
        let mut url = self.base_url.join("transaction/verify/")?;
        url.path_segments_mut()
            .map_err(|_| PaystackError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .push(reference);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.secret_key)
            .send()
            .await?;

        parse_envelope(response).await
    }
}

/// Body of `POST /transaction/initialize`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InitializeRequest {
    pub email: String,
    /// Amount in the currency's minor unit.
    pub amount: i64,
    pub reference: String,
    pub callback_url: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct InitializeData {
    pub authorization_url: String,
    pub access_code: String,
    pub reference: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Transaction {
    pub reference: String,
    pub status: String,
    /// Amount in the currency's minor unit.
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub paid_at: Option<String>,
    #[serde(default)]
    pub customer: Option<Customer>,
    #[serde(default)]
    pub metadata: Value,
}

impl Transaction {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    /// Terminal non-success states. `abandoned` and `ongoing` may still change.
    pub fn is_failed(&self) -> bool {
        matches!(self.status.as_str(), "failed" | "reversed")
    }

    /// Checkout metadata, which Paystack may echo back as an object or a JSON string.
    pub fn checkout_metadata(&self) -> CheckoutMetadata {
        let value = match &self.metadata {
            Value::String(raw) => serde_json::from_str(raw).unwrap_or(Value::Null),
            other => other.clone(),
        };
        serde_json::from_value(value).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Customer {
    #[serde(default)]
    pub email: Option<String>,
}

/// Metadata attached at checkout so a webhook can be matched to its campaign.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutMetadata {
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub contributor_id: Option<String>,
    #[serde(default)]
    pub contributor_name: Option<String>,
    #[serde(default)]
    pub anonymous: bool,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

/// Errors that can occur when talking to Paystack.
#[derive(Debug, Error)]
pub enum PaystackError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("paystack rejected the request: {message}")]
    Rejected { message: String },
}

async fn parse_envelope<T>(response: Response) -> Result<T, PaystackError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(PaystackError::Status { status, body });
    }

    let envelope: Envelope<T> = response.json().await?;
    match envelope {
        Envelope {
            status: true,
            data: Some(data),
            ..
        } => Ok(data),
        Envelope { message, .. } => Err(PaystackError::Rejected { message }),
    }
}

/// Checks the `x-paystack-signature` header: hex HMAC-SHA512 of the raw body keyed by the secret key.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let provided = match hex::decode(signature.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match Hmac::<Sha512>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    expected.as_slice().ct_eq(provided.as_slice()).into()
}
