//! Profile API client. Reqwest only; the backend mounts the router at `/profiles`.

use crate::profile::{Profile, ProfileDraft, ProfileId};
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("profiles request: {0}")]
    Http(#[from] reqwest::Error),
    /// Non-success status. `detail` is the server's `detail` field, or `Error {status}`.
    #[error("{detail}")]
    Status { status: u16, detail: String },
    #[error("profiles response parse: {0}")]
    Decode(String),
    /// A newer fetch started while this one was running; its result is discarded.
    #[error("superseded by a newer fetch")]
    Superseded,
}

impl FetchError {
    /// Worth another attempt: connection trouble, timeouts, 408, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            FetchError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            FetchError::Decode(_) | FetchError::Superseded => false,
        }
    }
}

/// Where profiles come from.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn list_profiles(&self, include_tokens: bool) -> Result<Vec<Profile>, FetchError>;
    async fn get_profile(&self, id: ProfileId) -> Result<Profile, FetchError>;
    async fn create_profile(&self, draft: &ProfileDraft) -> Result<Profile, FetchError>;
}

/// HTTP source for the crawldeck backend (`{base}/profiles`).
pub struct HttpProfileSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpProfileSource {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn decode<T: serde::de::DeserializeOwned>(res: reqwest::Response) -> Result<T, FetchError> {
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                detail: error_detail(status.as_u16(), &text),
            });
        }
        serde_json::from_str(&text).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

/// FastAPI puts the human-readable reason in `detail`.
fn error_detail(status: u16, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or_else(|| format!("Error {}", status))
}

#[async_trait]
impl ProfileSource for HttpProfileSource {
    async fn list_profiles(&self, include_tokens: bool) -> Result<Vec<Profile>, FetchError> {
        let url = format!("{}/profiles", self.base_url);
        let res = self
            .client
            .get(&url)
            .query(&[("include_tokens", include_tokens)])
            .send()
            .await?;
        Self::decode(res).await
    }

    async fn get_profile(&self, id: ProfileId) -> Result<Profile, FetchError> {
        let url = format!("{}/profiles/{}", self.base_url, id);
        let res = self
            .client
            .get(&url)
            .query(&[("include_tokens", true)])
            .send()
            .await?;
        Self::decode(res).await
    }

    async fn create_profile(&self, draft: &ProfileDraft) -> Result<Profile, FetchError> {
        let url = format!("{}/profiles", self.base_url);
        let res = self.client.post(&url).json(draft).send().await?;
        Self::decode(res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_prefers_server_message() {
        assert_eq!(error_detail(404, r#"{"detail":"Perfil no encontrado"}"#), "Perfil no encontrado");
        assert_eq!(error_detail(502, "<html>bad gateway</html>"), "Error 502");
    }

    #[test]
    fn transient_classification() {
        let s = |status| FetchError::Status { status, detail: String::new() };
        assert!(s(503).is_transient());
        assert!(s(429).is_transient());
        assert!(!s(404).is_transient());
        assert!(!FetchError::Decode("x".into()).is_transient());
        assert!(!FetchError::Superseded.is_transient());
    }

    #[test]
    fn base_url_is_normalized() {
        let source = HttpProfileSource::new("http://localhost:8000/api/", Duration::from_secs(1));
        assert_eq!(source.base_url(), "http://localhost:8000/api");
    }
}
