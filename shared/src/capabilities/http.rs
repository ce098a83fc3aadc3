use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// One backend record, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Column/value equality predicate selecting the rows an update or delete
/// applies to. Every pair must match.
pub type MatchCriteria = serde_json::Map<String, Value>;

pub const MAX_URL_LENGTH: usize = 2048;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// Error Types
// ============================================================================

/// Whether a failed backend call is worth retrying later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// The request never got a verdict from the backend.
    Network,
    /// The backend answered and refused the request.
    Rejection,
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::Network)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("network failure: {message}")]
    Network { message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("backend unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("rejected by backend ({status}): {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl BackendError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            code: None,
            message: message.into(),
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            BackendError::Network { .. }
            | BackendError::Timeout { .. }
            | BackendError::Unavailable { .. } => FailureClass::Network,
            BackendError::Rejected { .. }
            | BackendError::InvalidRequest { .. }
            | BackendError::InvalidResponse { .. } => FailureClass::Rejection,
        }
    }

    pub fn is_network(&self) -> bool {
        self.class() == FailureClass::Network
    }

    /// Classifies a non-2xx response. Gateway and request-timeout statuses
    /// mean the request never reached a backend able to judge it.
    pub fn from_status(status: u16, body: &str) -> Self {
        #[derive(Deserialize)]
        struct ErrorBody {
            code: Option<String>,
            message: Option<String>,
        }

        let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
        let (code, message) = match parsed {
            Some(ErrorBody { code, message }) => {
                (code, message.unwrap_or_else(|| truncate(body)))
            }
            None => (None, truncate(body)),
        };

        match status {
            408 | 429 | 502 | 503 | 504 => BackendError::Unavailable { status, message },
            _ => BackendError::Rejected {
                status,
                code,
                message,
            },
        }
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 256;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

// ============================================================================
// Contracts
// ============================================================================

/// The minimal data contract the offline core needs from the hosted backend.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn insert(&self, target: &str, payload: &Row) -> Result<(), BackendError>;

    async fn update(
        &self,
        target: &str,
        payload: &Row,
        criteria: &MatchCriteria,
    ) -> Result<(), BackendError>;

    async fn delete(&self, target: &str, criteria: &MatchCriteria) -> Result<(), BackendError>;

    /// Authoritative read of every row matching `criteria`.
    async fn select(&self, target: &str, criteria: &MatchCriteria) -> Result<Vec<Row>, BackendError>;
}

/// A cheap request against an always-available endpoint. Any answer counts
/// as reachable; only transport failures are errors.
#[async_trait::async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> Result<(), BackendError>;
}

// ============================================================================
// URL validation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: String,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, BackendError> {
        let url = url.into();
        let trimmed = url.trim();

        if trimmed.is_empty() {
            return Err(BackendError::InvalidRequest {
                reason: "URL cannot be empty".to_string(),
            });
        }
        if trimmed.len() > MAX_URL_LENGTH {
            return Err(BackendError::InvalidRequest {
                reason: format!("URL exceeds maximum length of {} bytes", MAX_URL_LENGTH),
            });
        }

        let parsed = Url::parse(trimmed).map_err(|e| BackendError::InvalidRequest {
            reason: format!("invalid URL '{}': {}", trimmed, e),
        })?;

        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(BackendError::InvalidRequest {
                reason: format!("invalid scheme '{scheme}', only 'http' and 'https' are allowed"),
            });
        }
        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(BackendError::InvalidRequest {
                reason: "credentials in URL are not allowed".to_string(),
            });
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| BackendError::InvalidRequest {
                reason: "URL must have a host".to_string(),
            })?
            .to_lowercase();

        Ok(Self {
            url: parsed.to_string(),
            host,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn to_url(&self) -> Result<Url, BackendError> {
        Url::parse(&self.url).map_err(|e| BackendError::InvalidRequest {
            reason: e.to_string(),
        })
    }
}

/// Renders a criteria value as a PostgREST filter operand.
///
/// Scalars become `eq` (or `is.null`); an array of scalars becomes an `in`
/// list, so one write can target a set of rows.
pub fn filter_operand(value: &Value) -> Result<String, BackendError> {
    match value {
        Value::Null => Ok("is.null".to_string()),
        Value::Bool(b) => Ok(format!("eq.{b}")),
        Value::Number(n) => Ok(format!("eq.{n}")),
        Value::String(s) => Ok(format!("eq.{s}")),
        Value::Array(values) => {
            if values.is_empty() {
                return Err(BackendError::InvalidRequest {
                    reason: "match criteria lists must not be empty".to_string(),
                });
            }
            let members = values
                .iter()
                .map(in_member)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!("in.({})", members.join(",")))
        }
        Value::Object(_) => Err(BackendError::InvalidRequest {
            reason: "match criteria values must be scalars or lists of scalars".to_string(),
        }),
    }
}

fn in_member(value: &Value) -> Result<String, BackendError> {
    match value {
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(format!(
            "\"{}\"",
            s.replace('\\', "\\\\").replace('"', "\\\"")
        )),
        _ => Err(BackendError::InvalidRequest {
            reason: "match criteria lists may only hold strings, numbers and booleans"
                .to_string(),
        }),
    }
}

// ============================================================================
// REST backend (PostgREST dialect)
// ============================================================================

#[cfg(feature = "http")]
pub use self::rest::{HttpProbe, RestBackend, RestConfig};

#[cfg(feature = "http")]
mod rest {
    use super::{
        filter_operand, BackendError, MatchCriteria, ReachabilityProbe, Row, ValidatedUrl,
        DEFAULT_TIMEOUT_MS,
    };
    use crate::capabilities::Backend;
    use reqwest::{Client, Method, RequestBuilder, Response};
    use secrecy::{ExposeSecret, SecretString};
    use std::sync::RwLock;
    use std::time::Duration;
    use tracing::{debug, instrument};
    use url::Url;

    #[derive(Debug, Clone)]
    pub struct RestConfig {
        pub base_url: ValidatedUrl,
        pub api_key: SecretString,
        pub request_timeout_ms: u64,
    }

    impl RestConfig {
        pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, BackendError> {
            Ok(Self {
                base_url: ValidatedUrl::new(base_url)?,
                api_key: SecretString::new(api_key.into()),
                request_timeout_ms: DEFAULT_TIMEOUT_MS,
            })
        }

        pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
            self.request_timeout_ms = timeout_ms;
            self
        }
    }

    /// Talks to a PostgREST endpoint (`/rest/v1/<table>`), the REST surface
    /// of the hosted backend.
    pub struct RestBackend {
        client: Client,
        config: RestConfig,
        access_token: RwLock<Option<SecretString>>,
    }

    impl RestBackend {
        pub fn new(config: RestConfig) -> Result<Self, BackendError> {
            let builder = Client::builder();
            #[cfg(not(target_arch = "wasm32"))]
            let builder = builder.timeout(Duration::from_millis(config.request_timeout_ms));

            let client = builder.build().map_err(|e| BackendError::InvalidRequest {
                reason: e.to_string(),
            })?;

            Ok(Self {
                client,
                config,
                access_token: RwLock::new(None),
            })
        }

        /// Installs the signed-in user's token; `None` falls back to the API key.
        pub fn set_access_token(&self, token: Option<SecretString>) {
            if let Ok(mut slot) = self.access_token.write() {
                *slot = token;
            }
        }

        fn table_url(&self, target: &str, criteria: &MatchCriteria) -> Result<Url, BackendError> {
            let mut url = self.config.base_url.to_url()?;
            url.path_segments_mut()
                .map_err(|_| BackendError::InvalidRequest {
                    reason: "base URL cannot be a base".to_string(),
                })?
                .pop_if_empty()
                .extend(["rest", "v1", target]);

            if !criteria.is_empty() {
                let mut pairs = url.query_pairs_mut();
                for (column, value) in criteria {
                    pairs.append_pair(column, &filter_operand(value)?);
                }
            }
            Ok(url)
        }

        fn request(&self, method: Method, url: Url) -> RequestBuilder {
            let bearer = self
                .access_token
                .read()
                .ok()
                .and_then(|t| t.as_ref().map(|t| t.expose_secret().clone()))
                .unwrap_or_else(|| self.config.api_key.expose_secret().clone());

            self.client
                .request(method, url)
                .header("apikey", self.config.api_key.expose_secret())
                .bearer_auth(bearer)
        }

        async fn send(&self, builder: RequestBuilder) -> Result<Response, BackendError> {
            let response = builder
                .send()
                .await
                .map_err(|e| map_transport(&e, self.config.request_timeout_ms))?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let body = response.text().await.unwrap_or_default();
            Err(BackendError::from_status(status.as_u16(), &body))
        }
    }

    #[async_trait::async_trait]
    impl Backend for RestBackend {
        #[instrument(skip(self, target, payload), fields(table = target))]
        async fn insert(&self, target: &str, payload: &Row) -> Result<(), BackendError> {
            let url = self.table_url(target, &MatchCriteria::new())?;
            let builder = self
                .request(Method::POST, url)
                .header("Prefer", "return=minimal")
                .json(&[payload]);
            self.send(builder).await.map(|_| ())
        }

        #[instrument(skip(self, target, payload, criteria), fields(table = target))]
        async fn update(
            &self,
            target: &str,
            payload: &Row,
            criteria: &MatchCriteria,
        ) -> Result<(), BackendError> {
            let url = self.table_url(target, criteria)?;
            let builder = self
                .request(Method::PATCH, url)
                .header("Prefer", "return=minimal")
                .json(payload);
            self.send(builder).await.map(|_| ())
        }

        #[instrument(skip(self, target, criteria), fields(table = target))]
        async fn delete(&self, target: &str, criteria: &MatchCriteria) -> Result<(), BackendError> {
            if criteria.is_empty() {
                return Err(BackendError::InvalidRequest {
                    reason: "refusing to delete without match criteria".to_string(),
                });
            }
            let url = self.table_url(target, criteria)?;
            self.send(self.request(Method::DELETE, url)).await.map(|_| ())
        }

        #[instrument(skip(self, target, criteria), fields(table = target))]
        async fn select(
            &self,
            target: &str,
            criteria: &MatchCriteria,
        ) -> Result<Vec<Row>, BackendError> {
            let mut url = self.table_url(target, criteria)?;
            url.query_pairs_mut().append_pair("select", "*");

            let response = self.send(self.request(Method::GET, url)).await?;
            let rows: Vec<Row> = response.json().await.map_err(|e| {
                BackendError::InvalidResponse {
                    reason: e.to_string(),
                }
            })?;
            debug!(rows = rows.len(), "select completed");
            Ok(rows)
        }
    }

    /// HEAD request against a well-known endpoint such as `generate_204`.
    pub struct HttpProbe {
        client: Client,
        url: ValidatedUrl,
        timeout_ms: u64,
    }

    impl HttpProbe {
        pub fn new(url: &str, timeout: Duration) -> Result<Self, BackendError> {
            let builder = Client::builder();
            #[cfg(not(target_arch = "wasm32"))]
            let builder = builder.timeout(timeout);
            #[cfg(target_arch = "wasm32")]
            let _ = timeout;

            let client = builder.build().map_err(|e| BackendError::InvalidRequest {
                reason: e.to_string(),
            })?;
            Ok(Self {
                client,
                url: ValidatedUrl::new(url)?,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        }
    }

    #[async_trait::async_trait]
    impl ReachabilityProbe for HttpProbe {
        async fn probe(&self) -> Result<(), BackendError> {
            self.client
                .head(self.url.as_str())
                .send()
                .await
                .map(|_| ())
                .map_err(|e| map_transport(&e, self.timeout_ms))
        }
    }

    fn map_transport(e: &reqwest::Error, timeout_ms: u64) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout { timeout_ms }
        } else if e.is_builder() {
            BackendError::InvalidRequest {
                reason: e.to_string(),
            }
        } else if e.is_decode() {
            BackendError::InvalidResponse {
                reason: e.to_string(),
            }
        } else {
            BackendError::network(e.to_string())
        }
    }

}
