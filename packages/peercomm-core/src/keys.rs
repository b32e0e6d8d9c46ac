//! # Key Material
//!
//! Encoded private keys as they are kept in client and ephemeral key
//! records.
//!
//! The store never interprets key material. Public keys are plain
//! strings; private keys are wrapped in [`PrivateKey`] so they are wiped
//! from memory when the record is dropped and never show up in `Debug`
//! output or logs.

use std::fmt;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Encoded private key (only present on records owned by the self client)
///
/// ## Security
///
/// - The encoded key is zeroized when this value is dropped
/// - `Debug` prints a redacted placeholder
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    /// Wrap an encoded private key
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Borrow the encoded key
    ///
    /// ## Security Warning
    ///
    /// Only use this to hand the key to the crypto layer. Never log it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

impl ToSql for PrivateKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for PrivateKey {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        String::column_result(value).map(PrivateKey)
    }
}
