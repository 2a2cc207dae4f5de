//! External collaborator contracts: CRM client, property normalizer,
//! credential lookup.
//!
//! The engine never inspects error message text. The client returns a
//! typed CrmError and the engine classifies on the variant alone.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use std::time::Duration;
use thiserror::Error;

use crate::{content::ContentGenerator, error::ErrorCategory};

pub type Properties = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrmObject {
    Contacts,
    Deals,
    Notes,
    Calls,
    Tasks,
    Tickets,
}

impl CrmObject {
    pub const ALL: [CrmObject; 6] = [
        Self::Contacts,
        Self::Deals,
        Self::Notes,
        Self::Calls,
        Self::Tasks,
        Self::Tickets,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contacts => "contacts",
            Self::Deals => "deals",
            Self::Notes => "notes",
            Self::Calls => "calls",
            Self::Tasks => "tasks",
            Self::Tickets => "tickets",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrmOperation {
    Create,
    /// Target id travels in the `id` property.
    Update,
    Delete,
    Search,
}

/// What a successful call hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmRecord {
    pub id:  String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CrmError {
    #[error("rate limited: {message}")]
    RateLimited { retry_after_ms: Option<i64>, message: String },

    #[error("network: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("unknown: {0}")]
    Unknown(String),
}

impl CrmError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CrmError::RateLimited { .. } => ErrorCategory::RateLimit,
            CrmError::Network(_) => ErrorCategory::Network,
            CrmError::Timeout(_) => ErrorCategory::Timeout,
            CrmError::Auth(_) => ErrorCategory::Auth,
            CrmError::Validation(_) => ErrorCategory::Validation,
            CrmError::Unknown(_) => ErrorCategory::Unknown,
        }
    }

    /// Server-provided retry hint, when there is one.
    pub fn retry_after_ms(&self) -> Option<i64> {
        match self {
            CrmError::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

/// The CRM API. Owns its own HTTP-level retries; the engine only sees the
/// final result of a call.
pub trait CrmClient: Send + Sync {
    fn call(
        &self,
        token: &str,
        object: CrmObject,
        operation: CrmOperation,
        properties: &Properties,
    ) -> Result<CrmRecord, CrmError>;
}

pub trait PropertyNormalizer: Send + Sync {
    fn normalize(&self, object: CrmObject, properties: Properties) -> Properties;
}

/// Resolves the API credential for a simulation owner. None means dry-run.
pub trait CredentialProvider: Send + Sync {
    fn token_for(&self, owner: &str) -> Option<String>;
}

pub struct PassthroughNormalizer;

impl PropertyNormalizer for PassthroughNormalizer {
    fn normalize(&self, _object: CrmObject, properties: Properties) -> Properties {
        properties
    }
}

#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    tokens: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(mut self, owner: &str, token: &str) -> Self {
        self.tokens.insert(owner.to_string(), token.to_string());
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn token_for(&self, owner: &str) -> Option<String> {
        self.tokens.get(owner).cloned()
    }
}

/// Stand-in for deployments with no CRM wired up. Every call fails with
/// `auth`; with no credentials configured it is never reached.
pub struct UnconfiguredClient;

impl CrmClient for UnconfiguredClient {
    fn call(&self, _: &str, object: CrmObject, _: CrmOperation, _: &Properties) -> Result<CrmRecord, CrmError> {
        Err(CrmError::Auth(format!("no CRM client configured for {}", object.as_str())))
    }
}

/// Everything the worker needs from outside, wired once at startup.
#[derive(Clone)]
pub struct Collaborators {
    pub client:      Arc<dyn CrmClient>,
    pub normalizer:  Arc<dyn PropertyNormalizer>,
    pub content:     Arc<dyn ContentGenerator>,
    pub credentials: Arc<dyn CredentialProvider>,
}

impl Collaborators {
    /// No credentials: every record runs in dry-run mode.
    pub fn dry_run() -> Self {
        Self {
            client:      Arc::new(UnconfiguredClient),
            normalizer:  Arc::new(PassthroughNormalizer),
            content:     Arc::new(crate::content::TemplateContentGenerator),
            credentials: Arc::new(StaticCredentials::none()),
        }
    }

    pub fn with_client(client: Arc<dyn CrmClient>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            client,
            credentials,
            ..Self::dry_run()
        }
    }
}

/// Run one CRM call on a helper thread, giving up after `timeout`.
///
/// A call that overruns keeps running in the background; its result is
/// discarded and the caller sees `CrmError::Timeout`.
pub fn call_with_timeout(
    client: &Arc<dyn CrmClient>,
    token: &str,
    object: CrmObject,
    operation: CrmOperation,
    properties: Properties,
    timeout: Duration,
) -> Result<CrmRecord, CrmError> {
    let (tx, rx) = mpsc::channel();
    let client = client.clone();
    let token = token.to_string();
    std::thread::spawn(move || {
        let result = client.call(&token, object, operation, &properties);
        let _ = tx.send(result);
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(CrmError::Timeout(format!(
            "{} {:?} exceeded {}ms",
            object.as_str(),
            operation,
            timeout.as_millis()
        ))),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(CrmError::Unknown(format!("{} call thread died", object.as_str())))
        }
    }
}
