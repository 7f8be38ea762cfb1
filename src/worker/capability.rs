//! External AI capabilities used by job handlers.
//!
//! The providers themselves are out of process. [`HttpCapabilityClient`]
//! talks JSON to a capability service; [`UnconfiguredCapability`] stands in
//! when none is configured.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Fields read off a student ID card.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFields {
    /// Student code printed on the card.
    #[serde(default)]
    pub student_code: Option<String>,
    /// Holder's full name.
    #[serde(default)]
    pub full_name: Option<String>,
    /// School or university name.
    #[serde(default)]
    pub school: Option<String>,
}

/// Text classification verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Toxicity probability in `[0, 1]`.
    pub toxicity: f64,
    /// Provider labels, informational only.
    #[serde(default)]
    pub labels: Vec<String>,
}

/// `extract(image) → structured fields`.
#[async_trait]
pub trait Extractor: Send + Sync + Debug {
    /// Reads the fields of the ID card at `image_url`.
    ///
    /// # Errors
    ///
    /// Returns an external-service error classified for retry.
    async fn extract(&self, image_url: &str) -> Result<ExtractedFields, GatewayError>;
}

/// `classify(content) → verdict`.
#[async_trait]
pub trait Classifier: Send + Sync + Debug {
    /// Scores `content`.
    ///
    /// # Errors
    ///
    /// Returns an external-service error classified for retry.
    async fn classify(&self, content: &str) -> Result<Classification, GatewayError>;
}

/// `embed(content) → vector`.
#[async_trait]
pub trait Embedder: Send + Sync + Debug {
    /// Computes an embedding for `content`.
    ///
    /// # Errors
    ///
    /// Returns an external-service error classified for retry.
    async fn embed(&self, content: &str) -> Result<Vec<f32>, GatewayError>;
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    image_url: &'a str,
}

#[derive(Serialize)]
struct TextRequest<'a> {
    content: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// JSON-over-HTTP capability client.
///
/// POSTs to `{base_url}/extract`, `/classify` and `/embed`. Every request
/// carries its own timeout; timeouts and transport failures surface as
/// retryable errors.
#[derive(Debug, Clone)]
pub struct HttpCapabilityClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpCapabilityClient {
    /// Creates a client with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, GatewayError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/{path}", self.base_url);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| transport_error(path, &e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::ExternalService {
                status: Some(status.as_u16()),
                message: format!("{path}: {message}"),
            });
        }
        let bytes = response.bytes().await.map_err(|e| transport_error(path, &e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::MalformedExternalResponse(format!("{path}: {e}")))
    }
}

fn transport_error(path: &str, err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::ExternalTimeout(path.to_string())
    } else {
        GatewayError::ExternalService {
            status: err.status().map(|s| s.as_u16()),
            message: format!("{path}: {err}"),
        }
    }
}

#[async_trait]
impl Extractor for HttpCapabilityClient {
    async fn extract(&self, image_url: &str) -> Result<ExtractedFields, GatewayError> {
        self.post("extract", &ExtractRequest { image_url }).await
    }
}

#[async_trait]
impl Classifier for HttpCapabilityClient {
    async fn classify(&self, content: &str) -> Result<Classification, GatewayError> {
        self.post("classify", &TextRequest { content }).await
    }
}

#[async_trait]
impl Embedder for HttpCapabilityClient {
    async fn embed(&self, content: &str) -> Result<Vec<f32>, GatewayError> {
        let response: EmbedResponse = self.post("embed", &TextRequest { content }).await?;
        if response.embedding.is_empty() {
            return Err(GatewayError::MalformedExternalResponse(
                "embed: empty vector".to_string(),
            ));
        }
        Ok(response.embedding)
    }
}

/// Fails every call non-retryably; used when `AI_SERVICE_URL` is unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredCapability;

fn unconfigured() -> GatewayError {
    GatewayError::ExternalService {
        status: Some(501),
        message: "AI_SERVICE_URL is not configured".to_string(),
    }
}

#[async_trait]
impl Extractor for UnconfiguredCapability {
    async fn extract(&self, _image_url: &str) -> Result<ExtractedFields, GatewayError> {
        Err(unconfigured())
    }
}

#[async_trait]
impl Classifier for UnconfiguredCapability {
    async fn classify(&self, _content: &str) -> Result<Classification, GatewayError> {
        Err(unconfigured())
    }
}

#[async_trait]
impl Embedder for UnconfiguredCapability {
    async fn embed(&self, _content: &str) -> Result<Vec<f32>, GatewayError> {
        Err(unconfigured())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_capability_is_not_retryable() {
        let err = UnconfiguredCapability.classify("hi").await.err();
        assert!(err.is_some_and(|e| !e.is_retryable()));
    }

    #[tokio::test]
    async fn unreachable_service_is_retryable() {
        let Ok(client) = HttpCapabilityClient::new(
            "http://127.0.0.1:9/",
            None,
            Duration::from_millis(200),
        ) else {
            panic!("client should build");
        };
        let err = client.embed("hello").await.err();
        assert!(err.is_some_and(|e| e.is_retryable()));
    }

    #[test]
    fn extracted_fields_tolerate_nulls() {
        let parsed: Result<ExtractedFields, _> =
            serde_json::from_str(r#"{"student_code": null, "full_name": "An"}"#);
        assert_eq!(
            parsed.ok(),
            Some(ExtractedFields {
                student_code: None,
                full_name: Some("An".to_string()),
                school: None,
            })
        );
    }
}
