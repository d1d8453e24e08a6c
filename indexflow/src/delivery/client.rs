//! Delivery client contract and its HTTP implementation.

use crate::errors::DeliveryError;
#[cfg(feature = "http")]
use crate::{config::SinkConfig, errors::IndexflowError};

/// Response of a delivery call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body as text.
    pub body: String,
}

impl DeliveryResponse {
    /// Creates a response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Creates an empty 200 response.
    #[must_use]
    pub fn ok() -> Self {
        Self::new(200, "")
    }

    /// Whether the call succeeded (2xx status).
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the endpoint does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

/// Transport used by the sink to reach the indexing service.
///
/// Implementations are shared by every delivery thread and must tolerate
/// concurrent calls. Transport failures are reported as `DeliveryError`; a
/// non-2xx answer is a successful call carrying that status.
#[cfg_attr(test, mockall::automock)]
pub trait DeliveryClient: Send + Sync {
    /// Posts a request body to `path`.
    fn post(&self, path: &str, body: &str) -> Result<DeliveryResponse, DeliveryError>;

    /// Issues a GET request to `path` with query parameters.
    fn get(&self, path: &str, params: &[(String, String)]) -> Result<DeliveryResponse, DeliveryError>;
}

/// Blocking HTTP client for a JSON update endpoint.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpDeliveryClient {
    base_url: String,
    client: reqwest::blocking::Client,
    basic_auth: Option<(String, Option<String>)>,
}

#[cfg(feature = "http")]
impl HttpDeliveryClient {
    /// Creates a client for the service at `config.url`, honoring the
    /// configured timeouts and credentials.
    ///
    /// # Errors
    ///
    /// Returns `IndexflowError::Usage` for an invalid configuration or URL.
    pub fn new(config: &SinkConfig) -> Result<Self, IndexflowError> {
        config.validate()?;
        let base_url = config.url.trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url)
            .map_err(|e| IndexflowError::usage(format!("invalid url '{}': {e}", config.url)))?;

        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("indexflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IndexflowError::usage(format!("cannot build HTTP client: {e}")))?;

        let basic_auth = config
            .basic_auth_user
            .clone()
            .map(|user| (user, config.basic_auth_password.clone()));

        Ok(Self {
            base_url,
            client,
            basic_auth,
        })
    }

    /// Returns the base URL requests are made against.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder) -> Result<DeliveryResponse, DeliveryError> {
        let request = match &self.basic_auth {
            Some((user, password)) => request.basic_auth(user, password.as_ref()),
            None => request,
        };
        let response = request.send().map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(classify)?;
        Ok(DeliveryResponse { status, body })
    }
}

#[cfg(feature = "http")]
impl DeliveryClient for HttpDeliveryClient {
    fn post(&self, path: &str, body: &str) -> Result<DeliveryResponse, DeliveryError> {
        self.send(
            self.client
                .post(self.url(path))
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_string()),
        )
    }

    fn get(&self, path: &str, params: &[(String, String)]) -> Result<DeliveryResponse, DeliveryError> {
        self.send(self.client.get(self.url(path)).query(params))
    }
}

#[cfg(feature = "http")]
fn classify(err: reqwest::Error) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::timeout(err.to_string())
    } else if err.is_connect() {
        DeliveryError::connect(err.to_string())
    } else {
        DeliveryError::transport(err.to_string())
    }
}
