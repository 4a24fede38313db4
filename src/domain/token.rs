use crate::domain::TokenId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What a managed credential is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Root,
    UnsealShare,
    Service,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Root => "root",
            TokenKind::UnsealShare => "unseal_share",
            TokenKind::Service => "service",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(TokenKind::Root),
            "unseal_share" => Ok(TokenKind::UnsealShare),
            "service" => Ok(TokenKind::Service),
            other => Err(format!("unknown token kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    /// Created at the store but not yet verified
    Pending,
    Active,
    Revoked,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Pending => "pending",
            TokenStatus::Active => "active",
            TokenStatus::Revoked => "revoked",
        }
    }
}

impl FromStr for TokenStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TokenStatus::Pending),
            "active" => Ok(TokenStatus::Active),
            "revoked" => Ok(TokenStatus::Revoked),
            other => Err(format!("unknown token status '{other}'")),
        }
    }
}

/// A managed credential. The value is only ever held encrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: TokenId,
    pub environment: String,
    pub kind: TokenKind,
    pub status: TokenStatus,
    /// Base64 AES-256-GCM ciphertext with the tag appended
    pub encrypted_value: String,
    /// Base64 12-byte nonce
    pub nonce: String,
    pub key_version: String,
    pub policies: Vec<String>,
    pub ttl: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub access_count: i64,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    pub fn is_active(&self) -> bool {
        self.status == TokenStatus::Active
    }

    pub fn summary(&self) -> TokenSummary {
        TokenSummary {
            id: self.id.clone(),
            kind: self.kind,
            status: self.status,
            policies: self.policies.clone(),
            ttl: self.ttl.clone(),
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            access_count: self.access_count,
            revoked_at: self.revoked_at,
        }
    }
}

/// Metadata view of a record, for listings
#[derive(Debug, Clone, Serialize)]
pub struct TokenSummary {
    pub id: TokenId,
    pub kind: TokenKind,
    pub status: TokenStatus,
    pub policies: Vec<String>,
    pub ttl: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub access_count: i64,
    pub revoked_at: Option<DateTime<Utc>>,
}
