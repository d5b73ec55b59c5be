//! Profile records as served by the crawldeck backend.
//! The client never owns a profile; everything here is a cached copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name given to a profile created without one. Matches the default placeholder label,
/// so such drafts never become an automatic selection.
pub const DRAFT_PROFILE_NAME: &str = "Nuevo Perfil";

/// Remote identity of a profile. Immutable and unique within one remote list.
pub type ProfileId = i64;

/// Decrypted Crawlbase tokens. Only present when the list was requested with `include_tokens`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileTokens {
    pub normal: String,
    #[serde(default)]
    pub javascript: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub storage: Option<String>,
}

/// One named credential/config bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    /// Display label. Drives both the placeholder filter and the default-selection heuristic.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Crawlbase product used when none is specified (e.g. `crawling-api`).
    #[serde(default)]
    pub default_product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<ProfileTokens>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl Profile {
    /// Minimal profile with only identity and name; the rest defaulted.
    pub fn new(id: ProfileId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: None,
            default_product: None,
            tokens: None,
            tags: Vec::new(),
            metadata: None,
            is_active: true,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_tokens(mut self, tokens: ProfileTokens) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Copy with the credential bundle removed. Used before anything is written to disk.
    pub fn without_tokens(&self) -> Self {
        Self {
            tokens: None,
            ..self.clone()
        }
    }

    /// Lowercased, trimmed name used by every name-based rule.
    pub fn normalized_name(&self) -> String {
        self.name.trim().to_lowercase()
    }
}

/// Creation payload for `POST /profiles`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub token_normal: String,
    #[serde(default)]
    pub token_js: Option<String>,
    #[serde(default)]
    pub token_proxy: Option<String>,
    #[serde(default)]
    pub token_storage: Option<String>,
    #[serde(default)]
    pub default_product: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Rejections raised before a draft is sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DraftError {
    #[error("the normal (Crawling API) token is required")]
    MissingNormalToken,
}

impl ProfileDraft {
    pub fn new(name: impl Into<String>, token_normal: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token_normal: token_normal.into(),
            default_product: Some("crawling-api".to_string()),
            is_active: true,
            ..Default::default()
        }
    }

    /// Normalizes the draft the way the backend expects it.
    ///
    /// The normal token is mandatory. A blank name falls back to [`DRAFT_PROFILE_NAME`] and
    /// blank optional strings are sent as `null`.
    pub fn validated(self) -> Result<Self, DraftError> {
        let Self {
            name,
            description,
            token_normal,
            token_js,
            token_proxy,
            token_storage,
            default_product,
            is_active,
            tags,
            metadata,
        } = self;
        if token_normal.trim().is_empty() {
            return Err(DraftError::MissingNormalToken);
        }
        let name = if name.trim().is_empty() {
            DRAFT_PROFILE_NAME.to_string()
        } else {
            name.trim().to_string()
        };
        Ok(Self {
            name,
            description: non_blank(description),
            token_normal: token_normal.trim().to_string(),
            token_js: non_blank(token_js),
            token_proxy: non_blank(token_proxy),
            token_storage: non_blank(token_storage),
            default_product: non_blank(default_product),
            is_active,
            tags,
            metadata,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
