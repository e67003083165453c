use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Serialized OAuth credential bundle. Stored and returned as-is.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPayload(String);

impl TokenPayload {
    pub fn new(raw: impl Into<String>) -> Self {
        TokenPayload(raw.into())
    }

    pub fn from_credential(credential: &OAuthCredential) -> Result<Self, StoreError> {
        serde_json::to_string(credential)
            .map(TokenPayload)
            .map_err(|e| StoreError::MalformedPayload(e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// A payload is well-formed when it parses as a JSON object. Nothing
    /// inside the object is inspected.
    pub fn validate(&self) -> Result<(), StoreError> {
        match serde_json::from_str::<serde_json::Value>(&self.0) {
            Ok(serde_json::Value::Object(_)) => Ok(()),
            Ok(_) => Err(StoreError::MalformedPayload(
                "credential is not a JSON object".into(),
            )),
            Err(e) => Err(StoreError::MalformedPayload(e.to_string())),
        }
    }

    /// Best-effort typed view, for callers that need the fields.
    pub fn credential(&self) -> Option<OAuthCredential> {
        serde_json::from_str(&self.0).ok()
    }
}

// Never print the secret material.
impl fmt::Debug for TokenPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenPayload(<{} bytes>)", self.0.len())
    }
}

/// Fields an OAuth collaborator puts in the payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCredential {
    #[serde(alias = "token", alias = "access_token")]
    pub access_token: String,
    #[serde(default, alias = "refresh_token")]
    pub refresh_token: Option<String>,
    #[serde(alias = "token_uri", alias = "token_endpoint")]
    pub token_endpoint: String,
    #[serde(alias = "client_id")]
    pub client_id: String,
    #[serde(alias = "client_secret")]
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthCredential {
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

impl fmt::Debug for OAuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredential")
            .field("token_endpoint", &self.token_endpoint)
            .field("client_id", &self.client_id)
            .field("scopes", &self.scopes)
            .field("has_refresh_token", &self.has_refresh_token())
            .finish_non_exhaustive()
    }
}

/// Where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    Canonical,
    /// Found only in the legacy column on the user row (and copied forward).
    LegacyMirror,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredToken {
    pub payload: TokenPayload,
    pub source: TokenSource,
    pub linked_account_email: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Lifecycle of a user's credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Absent,
    Present,
    /// A downstream API rejected it; kept for diagnostics, never served.
    InvalidatedByDownstream,
}
