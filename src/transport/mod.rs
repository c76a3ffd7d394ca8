//! The boundary between the protocol state machine (components C–I) and
//! whatever actually talks to a card. Protocol code is written once against
//! [`ReaderBackend`]/[`CardConnection`] and runs unchanged over either the
//! real PC/SC backend ([`pcsc_backend`]) or the in-memory [`mock`] used by
//! tests.

pub mod mock;
pub mod pcsc_backend;

use crate::error::Result;

/// How a connection should be shared with other applications on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShareMode {
    #[default]
    Shared,
    Exclusive,
}

/// Transmission protocol negotiated with the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardProtocol {
    T0,
    T1,
}

/// What should happen to the card when a transaction ends or the
/// connection is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    #[default]
    LeaveCard,
    ResetCard,
    UnpowerCard,
    EjectCard,
}

/// A reader-manager handle: enumerates readers and opens connections.
/// Implemented once for the real resource manager ([`pcsc_backend::PcscBackend`])
/// and once for tests ([`mock::MockBackend`]).
pub trait ReaderBackend {
    type Connection: CardConnection;

    /// Names of readers currently visible to this backend.
    fn list_readers(&self) -> Result<Vec<String>>;

    /// Opens a connection to the card in `reader`, negotiating a protocol
    /// from `preferred` in order.
    fn connect(
        &self,
        reader: &str,
        mode: ShareMode,
        preferred: &[CardProtocol],
    ) -> Result<Self::Connection>;
}

/// A single open connection to a card: transactions and raw byte transceive.
/// This is the seam the protocol layer is built on — it never sees `pcsc`
/// types directly.
pub trait CardConnection {
    /// Begins a transaction (exclusive use of the card for the duration).
    fn begin_transaction(&mut self) -> Result<()>;

    /// Ends the current transaction with the given disposition.
    fn end_transaction(&mut self, disposition: Disposition) -> Result<()>;

    /// Sends one raw command APDU and returns the raw response, including
    /// its trailing status word.
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>>;

    /// Disconnects, applying `disposition`.
    fn release(self, disposition: Disposition) -> Result<()>;
}
