//! Error types for the Marketo client.
//!
//! # Design
//! Marketo reports most failures inside a `200 OK` envelope
//! (`success: false` plus a list of `{code, message}` errors), so variants are
//! chosen by what the caller can do about them rather than by HTTP status:
//! re-authenticate (`Auth`), give up on the record (`NotFound`), fix the
//! payload (`Validation`), or inspect the raw failure (`Api`). `Transport`,
//! `Serialization` and `Deserialization` are the transport-level members of
//! the same "API error" family.

/// Errors returned by `Client`, `Lead` and the `MarketoApi` parse methods.
#[derive(Debug, thiserror::Error)]
pub enum MarketoError {
    /// The identity endpoint rejected the client credentials or could not be
    /// reached, or the REST API rejected the access token twice in a row.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// The requested lead does not exist.
    #[error("lead {id} not found")]
    NotFound { id: u64 },

    /// Marketo rejected the field values of an update.
    #[error("validation failed ({code}): {message}")]
    Validation { code: String, message: String },

    /// Any other non-success response. `status` is the HTTP status, or 0 when
    /// the request was refused before sending; `code` is the Marketo error
    /// code when the failure came inside an envelope.
    #[error("API error (HTTP {status}, code {code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The HTTP exchange itself failed (DNS, TCP, TLS, body read).
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A request payload could not be encoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A response body did not have the expected shape.
    #[error("deserialization failed: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl MarketoError {
    /// `true` for the variants that reflect a rejected or missing credential.
    pub fn is_auth(&self) -> bool {
        matches!(self, MarketoError::Auth { .. })
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MarketoError>;
