//! A PIV (Personal Identity Verification, NIST SP 800-73) smart card
//! client: APDU/TLV codecs, a PC/SC-backed transport, the protocol state
//! machine (discovery, PIN/admin authentication, key generation, signing,
//! ECDH), and an ECDH sealed-box envelope for offline-encrypted payloads.
//!
//! A session starts by enumerating readers, selecting a token, and
//! authenticating:
//!
//! ```no_run
//! use piv_session::transport::pcsc_backend::PcscBackend;
//! use piv_session::{config::ClientConfig, constants::PinRef, discovery};
//! use secrecy::SecretString;
//!
//! # fn run() -> piv_session::error::Result<()> {
//! let backend = PcscBackend::establish()?;
//! let config = ClientConfig::default();
//! let mut token = discovery::discover_one(&backend, "Yubico YubiKey", &config)?;
//! token.begin_txn()?;
//! let pin = SecretString::from("123456".to_string());
//! token.verify_pin(PinRef::Application, &pin, true)?;
//! token.read_all_certs()?;
//! # Ok(())
//! # }
//! ```

pub mod apdu;
pub mod auth;
pub mod config;
pub mod constants;
pub mod crypto_ops;
pub mod discovery;
pub mod error;
pub mod sealed_box;
pub mod slot;
pub mod tlv;
pub mod token;
pub mod transport;

pub use config::ClientConfig;
pub use discovery::{discover_one, enumerate, enumerate_readers};
pub use error::{Error, Result};
pub use sealed_box::SealedBox;
pub use slot::{Slot, SlotPublicKey};
pub use token::Token;
