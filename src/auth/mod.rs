// src/auth/mod.rs
// Auth boundary (§6.6): verification only. The core never issues
// credentials; it resolves an already-issued bearer token to the
// identity that the rest of the stack should trust on a given channel.
//
pub mod jwt;

pub use jwt::JwtIdentityVerifier;

/// Identity a verified token resolves to. `display_name` falls back to
/// `participant_id` when the token carries no separate username claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub participant_id: String,
    pub display_name: String,
}

/// Resolves a bearer token into an identity, or rejects it. A missing or
/// invalid token is not this port's concern — callers decide whether to
/// degrade to an anonymous identity or fail the upgrade (§6.6).
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> anyhow::Result<VerifiedIdentity>;
}
