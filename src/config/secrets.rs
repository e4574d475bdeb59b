//! Secret handling utilities.
//!
//! Re-exports secrecy types and keeps the single place where broker
//! credentials are exposed.

pub use secrecy::{ExposeSecret, SecretString};

/// Borrow the plaintext of a secret. Only the delivery path calls this.
pub fn expose(secret: &SecretString) -> &str {
    secret.expose_secret()
}
