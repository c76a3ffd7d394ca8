//! Real PC/SC-backed [`ReaderBackend`]/[`CardConnection`], built on the
//! `pcsc` crate the way `poc/yubikey-apdu-poc`'s `select_piv_application`
//! connected to a reader and called `card.transmit`.

use pcsc::MAX_BUFFER_SIZE;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{CardConnection, CardProtocol, Disposition, ReaderBackend, ShareMode};

fn to_pcsc_protocols(preferred: &[CardProtocol]) -> pcsc::Protocols {
    let mut protocols = pcsc::Protocols::empty();
    for p in preferred {
        protocols |= match p {
            CardProtocol::T0 => pcsc::Protocols::T0,
            CardProtocol::T1 => pcsc::Protocols::T1,
        };
    }
    protocols
}

fn to_pcsc_share_mode(mode: ShareMode) -> pcsc::ShareMode {
    match mode {
        ShareMode::Shared => pcsc::ShareMode::Shared,
        ShareMode::Exclusive => pcsc::ShareMode::Exclusive,
    }
}

fn to_pcsc_disposition(disposition: Disposition) -> pcsc::Disposition {
    match disposition {
        Disposition::LeaveCard => pcsc::Disposition::LeaveCard,
        Disposition::ResetCard => pcsc::Disposition::ResetCard,
        Disposition::UnpowerCard => pcsc::Disposition::UnpowerCard,
        Disposition::EjectCard => pcsc::Disposition::EjectCard,
    }
}

/// Distinguishes "the card was reset" from every other PC/SC failure, per
/// spec component C: `SCARD_W_RESET_CARD`/`SCARD_W_REMOVED_CARD` mean the
/// caller must re-select and re-authenticate, not just retry the I/O.
/// Everything else becomes [`Error::Io`].
fn classify_pcsc_error(e: pcsc::Error) -> Error {
    match e {
        pcsc::Error::ResetCard | pcsc::Error::RemovedCard => Error::Reset,
        other => Error::Io(other),
    }
}

/// PC/SC resource-manager handle.
pub struct PcscBackend {
    ctx: pcsc::Context,
}

impl PcscBackend {
    pub fn establish() -> Result<Self> {
        let ctx = pcsc::Context::establish(pcsc::Scope::User)?;
        Ok(PcscBackend { ctx })
    }
}

impl ReaderBackend for PcscBackend {
    type Connection = PcscConnection;

    fn list_readers(&self) -> Result<Vec<String>> {
        let mut buf = [0u8; 4096];
        let readers = self.ctx.list_readers(&mut buf)?;
        Ok(readers
            .map(|name| name.to_string_lossy().into_owned())
            .collect())
    }

    fn connect(
        &self,
        reader: &str,
        mode: ShareMode,
        preferred: &[CardProtocol],
    ) -> Result<Self::Connection> {
        let reader_cstr = std::ffi::CString::new(reader)
            .map_err(|_| Error::invalid_data("reader name contains an interior NUL"))?;
        let card = self.ctx.connect(
            &reader_cstr,
            to_pcsc_share_mode(mode),
            to_pcsc_protocols(preferred),
        )?;
        Ok(PcscConnection {
            // Safety: `txn` never outlives `card` — `card` is heap-allocated so
            // its address is stable across moves of `PcscConnection`, and `txn`
            // is declared before `card` in the struct so it drops first no
            // matter how the connection goes out of scope (early return,
            // panic, or a `Token` simply dropped without calling
            // `end_transaction`/`release`). The erased lifetime exists only
            // because `pcsc::Transaction<'_>` cannot be named alongside its own
            // borrowed `Card` in one struct in safe Rust.
            txn: None,
            card: Box::new(card),
        })
    }
}

/// An open connection plus at most one active transaction on it.
pub struct PcscConnection {
    // Declared before `card`: struct fields drop in declaration order, so
    // this guarantees `txn` (and the `SCardEndTransaction` its `Drop` impl
    // issues) always runs before `card` is freed, even if the connection is
    // dropped without an explicit `end_transaction`/`release` call.
    txn: Option<pcsc::Transaction<'static>>,
    card: Box<pcsc::Card>,
}

impl CardConnection for PcscConnection {
    fn begin_transaction(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Ok(());
        }
        let card_ref: &pcsc::Card = &self.card;
        // Safety: see the comment in `PcscBackend::connect`.
        let card_ref: &'static pcsc::Card = unsafe { std::mem::transmute(card_ref) };
        let txn = card_ref
            .transaction()
            .map_err(|(_, e)| classify_pcsc_error(e))?;
        self.txn = Some(txn);
        Ok(())
    }

    fn end_transaction(&mut self, disposition: Disposition) -> Result<()> {
        if let Some(txn) = self.txn.take() {
            // Infallible per spec component C: a card already reset or
            // removed has nothing left to tell `SCardEndTransaction`, and
            // the caller has already lost the transaction either way.
            let _ = txn.end(to_pcsc_disposition(disposition));
        }
        Ok(())
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let mut recv_buf = [0u8; MAX_BUFFER_SIZE];
        debug!(apdu = %hex::encode(command), "transmit");
        let response = if let Some(txn) = &self.txn {
            txn.transmit(command, &mut recv_buf)
                .map_err(classify_pcsc_error)?
        } else {
            self.card
                .transmit(command, &mut recv_buf)
                .map_err(classify_pcsc_error)?
        };
        Ok(response.to_vec())
    }

    fn release(mut self, disposition: Disposition) -> Result<()> {
        self.txn.take();
        match (*self.card).disconnect(to_pcsc_disposition(disposition)) {
            Ok(()) => Ok(()),
            Err((_, e)) => Err(classify_pcsc_error(e)),
        }
    }
}
