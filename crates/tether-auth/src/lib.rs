//! Connection admission for the Tether bridge.
//!
//! Decides, per connection attempt, whether a presented API key is valid and
//! which identity and per-caller environment it carries.
//!
//! # Main types
//!
//! - [`AuthConfig`]: Deserializable auth settings (header name, key, delegate URL).
//! - [`AuthMode`]: The resolution strategy selected from the config.
//! - [`AuthResolver`]: Resolves a credential to an [`Identity`], failing closed.
//! - [`CredentialResolver`]: Trait the gateway drives admission through.
//! - [`Identity`]: User id, permissions and environment for an admitted caller.

/// Identity carried by an admitted session.
pub mod identity;
/// Credential resolution strategies.
pub mod resolver;
/// Secret comparison and user id derivation.
pub mod secret;

pub use identity::Identity;
pub use resolver::{AuthConfig, AuthMode, AuthResolver, CredentialResolver};
pub use secret::{derive_user_id, secrets_match};
