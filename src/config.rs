//! Caller-supplied defaults, passed once at discovery time and carried on
//! every `Token` afterward so operations like `seal` don't need the cipher
//!/KDF choice repeated on every call.

use crate::constants::{PinPolicy, TouchPolicy};
use crate::transport::{CardProtocol, ShareMode};

/// AEAD cipher used to wrap a sealed box's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SealedBoxCipher {
    #[default]
    ChaCha20Poly1305,
    Aes256Gcm,
}

/// KDF used to derive the sealed-box wrap key from the ECDH shared secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SealedBoxKdf {
    #[default]
    HkdfSha256,
}

/// Defaults controlling how this library connects to readers and how it
/// generates keys and seals boxes, unless a call overrides them explicitly.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Whether to request shared or exclusive access when connecting.
    pub share_mode: ShareMode,
    /// Protocols to offer, in preference order.
    pub preferred_protocols: Vec<CardProtocol>,
    /// If set, PIN/PUK operations that would leave fewer than this many
    /// retries refuse to even attempt the verify, to avoid a caller
    /// accidentally locking the card out. `None` means no floor.
    pub min_pin_retries: Option<u8>,
    pub default_cipher: SealedBoxCipher,
    pub default_kdf: SealedBoxKdf,
    pub default_pin_policy: PinPolicy,
    pub default_touch_policy: TouchPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            share_mode: ShareMode::Shared,
            preferred_protocols: vec![CardProtocol::T1, CardProtocol::T0],
            min_pin_retries: None,
            default_cipher: SealedBoxCipher::default(),
            default_kdf: SealedBoxKdf::default(),
            default_pin_policy: PinPolicy::default(),
            default_touch_policy: TouchPolicy::default(),
        }
    }
}
