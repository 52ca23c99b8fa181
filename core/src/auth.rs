//! Access-token state for the client-credentials flow.
//!
//! The identity endpoint hands out bearer tokens with a lifetime in seconds.
//! `TokenState` caches the current token and reports it as absent once the
//! lifetime minus a safety buffer has elapsed, so the next call refreshes
//! before Marketo starts answering with code 602.

use std::time::{Duration, Instant};

use crate::types::TokenResponse;

/// Default seconds subtracted from `expires_in` before a token counts as expired.
pub const DEFAULT_EXPIRY_BUFFER_SECS: u64 = 60;

/// A bearer token and the moment it was acquired.
#[derive(Debug, Clone)]
pub struct AccessToken {
    value: String,
    expires_in: u64,
    acquired_at: Instant,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_in: u64) -> Self {
        Self {
            value: value.into(),
            expires_in,
            acquired_at: Instant::now(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_in(&self) -> Duration {
        Duration::from_secs(self.expires_in)
    }

    /// `true` once `expires_in - buffer` seconds have passed since acquisition.
    ///
    /// Marketo reissues a live token with only its remaining lifetime, which
    /// can already be inside the buffer. Such a token is used until
    /// `expires_in` itself has passed.
    pub fn is_expired(&self, buffer: Duration) -> bool {
        let buffer = buffer.as_secs();
        let lifetime = if self.expires_in > buffer {
            self.expires_in - buffer
        } else {
            self.expires_in
        };
        self.acquired_at.elapsed().as_secs() >= lifetime
    }
}

impl From<TokenResponse> for AccessToken {
    fn from(resp: TokenResponse) -> Self {
        AccessToken::new(resp.access_token, resp.expires_in)
    }
}

/// Cached token owned by a single `Client`.
///
/// Invariants:
/// - `current()` returns `None` before the first `store()`, after
///   `invalidate()`, and once the stored token is within `buffer` of expiry.
#[derive(Debug)]
pub struct TokenState {
    token: Option<AccessToken>,
    buffer: Duration,
}

impl TokenState {
    pub fn new(buffer: Duration) -> Self {
        Self { token: None, buffer }
    }

    pub fn current(&self) -> Option<&str> {
        self.token
            .as_ref()
            .filter(|token| !token.is_expired(self.buffer))
            .map(AccessToken::value)
    }

    pub fn store(&mut self, token: AccessToken) {
        self.token = Some(token);
    }

    pub fn invalidate(&mut self) {
        self.token = None;
    }
}

impl Default for TokenState {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_EXPIRY_BUFFER_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backdated(expires_in: u64, elapsed_secs: u64) -> AccessToken {
        let mut token = AccessToken::new("tok", expires_in);
        token.acquired_at = Instant::now() - Duration::from_secs(elapsed_secs);
        token
    }

    #[test]
    fn empty_state_has_no_token() {
        assert!(TokenState::default().current().is_none());
    }

    #[test]
    fn fresh_token_is_current() {
        let mut state = TokenState::default();
        state.store(AccessToken::new("abc", 3599));
        assert_eq!(state.current(), Some("abc"));
    }

    #[test]
    fn expired_token_is_not_current() {
        let mut state = TokenState::default();
        state.store(backdated(3599, 7200));
        assert!(state.current().is_none());
    }

    #[test]
    fn token_inside_buffer_counts_as_expired() {
        // 90s lifetime minus 60s buffer leaves 30s of use.
        assert!(backdated(90, 31).is_expired(Duration::from_secs(60)));
        assert!(!backdated(90, 10).is_expired(Duration::from_secs(60)));
    }

    #[test]
    fn lifetime_shorter_than_buffer_lasts_until_expiry() {
        let buffer = Duration::from_secs(60);
        assert!(!AccessToken::new("short", 45).is_expired(buffer));
        assert!(!backdated(45, 30).is_expired(buffer));
        assert!(backdated(45, 45).is_expired(buffer));
        assert!(AccessToken::new("gone", 0).is_expired(buffer));
    }

    #[test]
    fn invalidate_clears_token() {
        let mut state = TokenState::default();
        state.store(AccessToken::new("abc", 3599));
        state.invalidate();
        assert!(state.current().is_none());
    }

    #[test]
    fn converts_from_token_response() {
        let token = AccessToken::from(TokenResponse {
            access_token: "cdf01657-110d-4155-99a7-f986b2ff13a0:int".to_string(),
            token_type: "bearer".to_string(),
            expires_in: 3599,
            scope: Some("apis@acmeinc.com".to_string()),
        });
        assert_eq!(token.value(), "cdf01657-110d-4155-99a7-f986b2ff13a0:int");
        assert_eq!(token.expires_in(), Duration::from_secs(3599));
    }
}
