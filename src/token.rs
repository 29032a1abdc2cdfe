// ===============================
// src/token.rs
// ===============================
//
// Access token for the exchange feed. The refresh endpoint is an external
// collaborator; the feed only needs `refresh() -> AccessToken`.
//
use serde::Deserialize;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

pub const TOKEN_MAX_AGE: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

pub trait TokenSource: Send + Sync + 'static {
    fn refresh(&self) -> impl Future<Output = Result<String, TokenError>> + Send;
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(rename = "AccessToken")]
    access_token: String,
}

/// `POST <oauth>/refresh?token=<refresh token>`
pub struct HttpTokenRefresher {
    http: reqwest::Client,
    oauth_url: String,
    refresh_token: String,
}

impl HttpTokenRefresher {
    pub fn new(oauth_url: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), oauth_url: oauth_url.into(), refresh_token: refresh_token.into() }
    }
}

impl TokenSource for HttpTokenRefresher {
    async fn refresh(&self) -> Result<String, TokenError> {
        let url = format!(
            "{}/refresh?token={}",
            self.oauth_url.trim_end_matches('/'),
            urlencoding::encode(&self.refresh_token)
        );
        let rsp = self.http.post(url).send().await?;
        if !rsp.status().is_success() {
            let status = rsp.status().as_u16();
            let body = rsp.text().await.unwrap_or_default();
            return Err(TokenError::Status { status, body });
        }
        let parsed: RefreshResponse = rsp.json().await?;
        info!("access token refreshed");
        Ok(parsed.access_token)
    }
}

/// Last token plus the instant it was issued.
pub struct TokenCache<S> {
    source: S,
    max_age: Duration,
    current: Option<(String, Instant)>,
}

impl<S: TokenSource> TokenCache<S> {
    pub fn new(source: S) -> Self { Self::with_max_age(source, TOKEN_MAX_AGE) }

    pub fn with_max_age(source: S, max_age: Duration) -> Self {
        Self { source, max_age, current: None }
    }

    pub fn is_stale(&self) -> bool {
        match &self.current {
            Some((_, at)) => at.elapsed() >= self.max_age,
            None => true,
        }
    }

    /// Current token, refreshed first when missing or older than `max_age`.
    pub async fn token(&mut self) -> Result<String, TokenError> {
        if self.is_stale() {
            let fresh = self.source.refresh().await?;
            self.current = Some((fresh, Instant::now()));
        }
        Ok(self.current.as_ref().map(|(t, _)| t.clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Counting(Arc<AtomicUsize>);

    impl TokenSource for Counting {
        async fn refresh(&self) -> Result<String, TokenError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("token-{n}"))
        }
    }

    #[tokio::test]
    async fn fresh_token_is_reused() {
        let src = Counting::default();
        let mut cache = TokenCache::new(src.clone());
        assert!(cache.is_stale());
        assert_eq!(cache.token().await.unwrap(), "token-1");
        assert_eq!(cache.token().await.unwrap(), "token-1");
        assert_eq!(src.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn old_token_is_refreshed() {
        let src = Counting::default();
        let mut cache = TokenCache::with_max_age(src.clone(), Duration::ZERO);
        assert_eq!(cache.token().await.unwrap(), "token-1");
        assert_eq!(cache.token().await.unwrap(), "token-2");
    }
}
