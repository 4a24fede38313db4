//! Secret handling
//!
//! - `types`: [`SecretString`], the redacting in-memory holder
//! - `encryption`: [`TokenCipher`], AES-256-GCM sealing of stored tokens

pub mod encryption;
pub mod types;

pub use encryption::{SealedValue, TokenCipher};
pub use types::SecretString;

/// Variables the ambient bootstrap token is read from, in order
pub const BOOTSTRAP_TOKEN_VARS: [&str; 2] = ["CUTOVER_BOOTSTRAP_TOKEN", "VAULT_TOKEN"];
