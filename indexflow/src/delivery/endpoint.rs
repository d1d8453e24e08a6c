//! Update endpoint resolution with one-time auto-detection.

use super::{DeliveryClient, DeliveryResponse};
use crate::errors::DeliveryError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Path tried first when no update path is configured.
pub const PRIMARY_UPDATE_PATH: &str = "/update/json";

/// Path tried when the primary path answers 404.
pub const FALLBACK_UPDATE_PATH: &str = "/update";

/// Resolves and caches the path update requests are posted to.
///
/// A configured path is used as is. Otherwise the first post tries
/// [`PRIMARY_UPDATE_PATH`]; a 404 there retries the same body on
/// [`FALLBACK_UPDATE_PATH`], which is remembered once it succeeds. The
/// detected path is shared by every delivery thread.
#[derive(Debug)]
pub struct UpdateEndpoint {
    configured: Option<String>,
    detected: RwLock<Option<&'static str>>,
    query: String,
}

impl UpdateEndpoint {
    /// Creates an endpoint. `params` are percent-encoded into the query
    /// string of every update post.
    #[must_use]
    pub fn new(configured: Option<String>, params: &BTreeMap<String, String>) -> Self {
        let query = params
            .iter()
            .map(|(key, value)| {
                format!("{}={}", urlencoding::encode(key), urlencoding::encode(value))
            })
            .collect::<Vec<_>>()
            .join("&");
        Self {
            configured,
            detected: RwLock::new(None),
            query,
        }
    }

    /// Returns the resolved update path, if known yet.
    #[must_use]
    pub fn resolved_path(&self) -> Option<String> {
        self.configured
            .clone()
            .or_else(|| self.detected.read().map(str::to_string))
    }

    /// Path for requests that do not carry documents, such as commits.
    #[must_use]
    pub fn control_path(&self) -> String {
        self.resolved_path()
            .unwrap_or_else(|| PRIMARY_UPDATE_PATH.to_string())
    }

    /// Posts a body to the update endpoint, detecting the path if needed.
    ///
    /// # Errors
    ///
    /// Returns the client's transport error.
    pub fn post(&self, client: &dyn DeliveryClient, body: &str) -> Result<DeliveryResponse, DeliveryError> {
        if let Some(path) = self.resolved_path() {
            return client.post(&self.with_query(&path), body);
        }

        let primary = client.post(&self.with_query(PRIMARY_UPDATE_PATH), body)?;
        if !primary.is_not_found() {
            self.remember(PRIMARY_UPDATE_PATH);
            return Ok(primary);
        }

        debug!(
            primary = PRIMARY_UPDATE_PATH,
            fallback = FALLBACK_UPDATE_PATH,
            "Update path not found, trying fallback"
        );
        let fallback = client.post(&self.with_query(FALLBACK_UPDATE_PATH), body)?;
        if fallback.is_success() {
            self.remember(FALLBACK_UPDATE_PATH);
        }
        Ok(fallback)
    }

    fn remember(&self, path: &'static str) {
        let mut detected = self.detected.write();
        if detected.is_none() {
            info!(path, "Detected update path");
            *detected = Some(path);
        }
    }

    fn with_query(&self, path: &str) -> String {
        if self.query.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{}", self.query)
        }
    }
}
