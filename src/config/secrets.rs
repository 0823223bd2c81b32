//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides helpers for working with
//! secrets such as the chat OAuth token.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Mask a secret for log output, keeping only a short prefix.
pub fn redact(secret: &SecretString) -> String {
    let raw = secret.expose_secret();
    let prefix: String = raw.chars().take(4).collect();
    if raw.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{prefix}****")
    }
}
