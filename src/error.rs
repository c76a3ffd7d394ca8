//! Crate-wide error type.
//!
//! Every variant here corresponds to one of the error kinds named in the
//! error handling design: `io`, `reset`, `invalid-data`, `not-found`,
//! `not-supported`, `permission`, `access-denied`, `would-lockout`, `apdu`,
//! `integrity`, `not-match`. None of them may ever carry a PIN, admin key,
//! management key, or derived symmetric key.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Resource-manager or reader communication failure.
    #[error("reader communication failure: {0}")]
    Io(#[from] pcsc::Error),

    /// The card was reset while a transaction was being acquired or held.
    /// The caller must re-select the applet and re-authenticate.
    #[error("card was reset; re-select and re-authenticate before retrying")]
    Reset,

    /// The card returned a payload that doesn't parse the way this protocol
    /// expects (malformed TLV, truncated APDU, unparseable certificate).
    #[error("invalid data from card: {0}")]
    InvalidData(String),

    /// The requested object, slot, or applet is not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// The card does not support this operation or algorithm.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A prerequisite authentication (PIN or admin) is missing.
    #[error("permission denied: {0}")]
    Permission(String),

    /// The credential supplied (PIN, PUK, admin key) was wrong.
    #[error(
        "access denied{}",
        retries_remaining
            .map(|r| format!(", {r} {} remaining", if *r == 1 { "try" } else { "tries" }))
            .unwrap_or_default()
    )]
    AccessDenied {
        /// Remaining PIN/PUK retries, when the card reported one.
        retries_remaining: Option<u8>,
    },

    /// The caller's minimum retry threshold would be violated by attempting
    /// this PIN/PUK entry, so the attempt was never sent to the card.
    #[error("attempting this PIN would leave only {remaining} retries, below the floor of {floor}")]
    WouldLockout { remaining: u8, floor: u8 },

    /// The card rejected the command with a status word we recognize as a
    /// plain rejection (i.e. not one of the retryable/informational ones
    /// the transport already handles).
    #[error("card rejected {context}: SW={sw:04X}")]
    Apdu { sw: u16, context: String },

    /// A sealed box's AEAD tag failed to verify on `open`.
    #[error("sealed box integrity check failed")]
    Integrity,

    /// Proof-of-possession failed: the card's signature did not verify
    /// against the caller-supplied public key.
    #[error("proof of possession failed: signature did not match supplied public key")]
    NotMatch,
}

impl Error {
    pub(crate) fn invalid_data(msg: impl Into<String>) -> Self {
        Error::InvalidData(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub(crate) fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    pub(crate) fn permission(msg: impl Into<String>) -> Self {
        Error::Permission(msg.into())
    }

    pub(crate) fn apdu(sw: u16, context: impl Into<String>) -> Self {
        Error::Apdu {
            sw,
            context: context.into(),
        }
    }
}
