//! Mock delivery clients and steps for testing.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use crate::context::ProcessingContext;
use crate::delivery::{DeliveryClient, DeliveryResponse};
use crate::errors::DeliveryError;
use crate::steps::TransformationStep;

/// What a scripted call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Answer with this response.
    Respond(DeliveryResponse),
    /// Fail with this transport error.
    Fail(DeliveryError),
}

impl ScriptedOutcome {
    /// An answer with the given status and empty body.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self::Respond(DeliveryResponse::new(status, ""))
    }

    fn into_result(self) -> Result<DeliveryResponse, DeliveryError> {
        match self {
            Self::Respond(response) => Ok(response),
            Self::Fail(err) => Err(err),
        }
    }
}

/// A call observed by [`RecordingDeliveryClient`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// `POST` or `GET`.
    pub method: &'static str,
    /// Path including any query string.
    pub path: String,
    /// Request body, empty for `GET`.
    pub body: String,
    /// Status answered, or `None` if the call failed.
    pub status: Option<u16>,
}

impl RecordedCall {
    /// Whether the call was answered with a 2xx status.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status.is_some_and(|status| (200..300).contains(&status))
    }

    /// Number of documents in the posted body, if it is a JSON array.
    #[must_use]
    pub fn document_count(&self) -> Option<usize> {
        match serde_json::from_str::<Value>(&self.body).ok()? {
            Value::Array(documents) => Some(documents.len()),
            _ => None,
        }
    }
}

/// An in-memory delivery client that records every call and answers from
/// a script.
///
/// A post is answered by the first match of: a path registered as not
/// found, the next queued outcome, a body rule, the default outcome.
#[derive(Debug)]
pub struct RecordingDeliveryClient {
    calls: Mutex<Vec<RecordedCall>>,
    queued: Mutex<VecDeque<ScriptedOutcome>>,
    rules: Mutex<Vec<(String, ScriptedOutcome)>>,
    not_found: Mutex<HashSet<String>>,
    default_outcome: Mutex<ScriptedOutcome>,
    delay: Mutex<Option<Duration>>,
}

impl Default for RecordingDeliveryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDeliveryClient {
    /// Creates a client that answers 200 to everything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            queued: Mutex::new(VecDeque::new()),
            rules: Mutex::new(Vec::new()),
            not_found: Mutex::new(HashSet::new()),
            default_outcome: Mutex::new(ScriptedOutcome::Respond(DeliveryResponse::ok())),
            delay: Mutex::new(None),
        }
    }

    /// Answers 404 for posts to `path`.
    #[must_use]
    pub fn with_not_found(self, path: impl Into<String>) -> Self {
        self.not_found.lock().insert(path.into());
        self
    }

    /// Answers every unscripted post with `outcome`.
    #[must_use]
    pub fn with_default(self, outcome: ScriptedOutcome) -> Self {
        *self.default_outcome.lock() = outcome;
        self
    }

    /// Answers posts whose body contains `needle` with `outcome`.
    #[must_use]
    pub fn with_body_rule(self, needle: impl Into<String>, outcome: ScriptedOutcome) -> Self {
        self.rules.lock().push((needle.into(), outcome));
        self
    }

    /// Sleeps this long in every call.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    /// Queues an outcome for the next unanswered post.
    pub fn push_outcome(&self, outcome: ScriptedOutcome) {
        self.queued.lock().push_back(outcome);
    }

    /// Returns all recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Returns recorded posts.
    #[must_use]
    pub fn posts(&self) -> Vec<RecordedCall> {
        self.calls_with_method("POST")
    }

    /// Returns recorded gets.
    #[must_use]
    pub fn gets(&self) -> Vec<RecordedCall> {
        self.calls_with_method("GET")
    }

    /// Returns the number of posts.
    #[must_use]
    pub fn post_count(&self) -> usize {
        self.posts().len()
    }

    /// Documents carried by successful posts, in call order.
    #[must_use]
    pub fn delivered_documents(&self) -> Vec<Value> {
        self.posts()
            .into_iter()
            .filter(RecordedCall::succeeded)
            .filter_map(|call| match serde_json::from_str::<Value>(&call.body) {
                Ok(Value::Array(documents)) => Some(documents),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Clears recorded calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn calls_with_method(&self, method: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.method == method)
            .cloned()
            .collect()
    }

    fn answer_post(&self, path: &str, body: &str) -> ScriptedOutcome {
        let bare_path = path.split('?').next().unwrap_or(path);
        if self.not_found.lock().contains(bare_path) {
            return ScriptedOutcome::Respond(DeliveryResponse::new(404, "Not Found"));
        }
        if let Some(outcome) = self.queued.lock().pop_front() {
            return outcome;
        }
        if let Some((_, outcome)) = self.rules.lock().iter().find(|(needle, _)| body.contains(needle.as_str())) {
            return outcome.clone();
        }
        self.default_outcome.lock().clone()
    }

    fn record(&self, method: &'static str, path: &str, body: &str, outcome: ScriptedOutcome) -> Result<DeliveryResponse, DeliveryError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let status = match &outcome {
            ScriptedOutcome::Respond(response) => Some(response.status),
            ScriptedOutcome::Fail(_) => None,
        };
        self.calls.lock().push(RecordedCall {
            method,
            path: path.to_string(),
            body: body.to_string(),
            status,
        });
        outcome.into_result()
    }
}

impl DeliveryClient for RecordingDeliveryClient {
    fn post(&self, path: &str, body: &str) -> Result<DeliveryResponse, DeliveryError> {
        let outcome = self.answer_post(path, body);
        self.record("POST", path, body, outcome)
    }

    fn get(&self, path: &str, params: &[(String, String)]) -> Result<DeliveryResponse, DeliveryError> {
        let query = params
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        let full_path = if query.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{query}")
        };
        self.record("GET", &full_path, "", ScriptedOutcome::Respond(DeliveryResponse::ok()))
    }
}

/// A step that fails on one record position.
pub struct FailingStep {
    description: String,
    position: u64,
    message: String,
}

impl FailingStep {
    /// Creates a step failing with `message` on the record at `position`.
    #[must_use]
    pub fn at_position(position: u64, message: impl Into<String>) -> Self {
        Self {
            description: format!("fail at record #{position}"),
            position,
            message: message.into(),
        }
    }
}

impl fmt::Debug for FailingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailingStep")
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl<R> TransformationStep<R> for FailingStep {
    fn description(&self) -> &str {
        &self.description
    }

    fn execute(&self, context: &mut ProcessingContext<R>) -> anyhow::Result<()> {
        if context.position() == self.position {
            anyhow::bail!("{}", self.message);
        }
        Ok(())
    }
}
