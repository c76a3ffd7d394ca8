//! `Token`: one live handle to a selected PIV applet on a connected card.
//! Mirrors `pivy`'s `struct piv_token`, which every protocol function in
//! `piv.h` takes as its first argument — rather than a separate `Session`
//! façade, the protocol operations in `discovery.rs`/`slot.rs`/`auth.rs`/
//! `crypto_ops.rs` are all `impl Token` blocks.

use tracing::{debug, instrument};

use crate::apdu::{CommandApdu, ResponseApdu};
use crate::config::ClientConfig;
use crate::constants::{AlgorithmId, CLA_CHAIN, CLA_ISO, INS_CONTINUE, INS_GET_DATA, INS_PUT_DATA};
use crate::error::{Error, Result};
use crate::slot::Slot;
use crate::tlv::encode_tlv;
use crate::transport::{CardConnection, Disposition};

/// Which card-native PIN mechanisms this token's discovery step found
/// usable. Populated by `select`; see spec component D.
#[derive(Debug, Clone, Copy, Default)]
pub struct PinCapabilities {
    pub application_pin: bool,
    pub global_pin: bool,
    pub on_card_biometric: bool,
    pub virtual_contact_interface: bool,
}

/// A selected applet on an open card connection: the post-authentication
/// state (PIN verified, admin authenticated), the card-discovery data
/// populated by `select`, and the slots read so far.
pub struct Token<C: CardConnection> {
    pub(crate) conn: C,
    pub(crate) config: ClientConfig,
    pub(crate) reader_name: String,
    pub(crate) selected: bool,
    pub(crate) pin_verified: bool,
    pub(crate) admin_authenticated: bool,
    pub(crate) in_transaction: bool,
    pub(crate) reset_observed: bool,

    pub(crate) aid: Vec<u8>,
    pub(crate) app_label: Option<String>,
    pub(crate) app_uri: Option<String>,
    pub(crate) guid: [u8; 16],
    pub(crate) chuid_uuid: [u8; 16],
    pub(crate) fasc_n: Vec<u8>,
    pub(crate) expiry: [u8; 8],
    pub(crate) algorithms: Vec<AlgorithmId>,
    pub(crate) admin_algorithm: AlgorithmId,
    pub(crate) pin_retries_last_seen: Option<u8>,
    pub(crate) is_yubico: bool,
    pub(crate) yubico_version: Option<[u8; 3]>,
    pub(crate) keyhist_on_card: u8,
    pub(crate) keyhist_off_card: u8,
    pub(crate) keyhist_url: Option<String>,
    pub(crate) chuid_missing: bool,
    pub(crate) chuid_signed: bool,
    pub(crate) pin_capabilities: PinCapabilities,
    pub(crate) slots: Vec<Slot>,
}

impl<C: CardConnection> Token<C> {
    pub(crate) fn new(conn: C, config: ClientConfig, reader_name: String) -> Self {
        Token {
            conn,
            config,
            reader_name,
            selected: false,
            pin_verified: false,
            admin_authenticated: false,
            in_transaction: false,
            reset_observed: false,
            aid: Vec::new(),
            app_label: None,
            app_uri: None,
            guid: [0; 16],
            chuid_uuid: [0; 16],
            fasc_n: Vec::new(),
            expiry: [0; 8],
            algorithms: Vec::new(),
            admin_algorithm: AlgorithmId::Tdes,
            pin_retries_last_seen: None,
            is_yubico: false,
            yubico_version: None,
            keyhist_on_card: 0,
            keyhist_off_card: 0,
            keyhist_url: None,
            chuid_missing: true,
            chuid_signed: false,
            pin_capabilities: PinCapabilities::default(),
            slots: Vec::new(),
        }
    }

    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_pin_verified(&self) -> bool {
        self.pin_verified
    }

    pub fn is_admin_authenticated(&self) -> bool {
        self.admin_authenticated
    }

    pub fn reset_observed(&self) -> bool {
        self.reset_observed
    }

    /// The AID reported in the Application Property Template, which may be
    /// a truncated prefix of the full PIV AID the card was SELECTed by.
    pub fn aid(&self) -> &[u8] {
        &self.aid
    }

    pub fn app_label(&self) -> Option<&str> {
        self.app_label.as_deref()
    }

    pub fn app_uri(&self) -> Option<&str> {
        self.app_uri.as_deref()
    }

    pub fn guid(&self) -> [u8; 16] {
        self.guid
    }

    pub fn algorithms(&self) -> &[AlgorithmId] {
        &self.algorithms
    }

    pub fn is_yubico(&self) -> bool {
        self.is_yubico
    }

    pub fn yubico_version(&self) -> Option<[u8; 3]> {
        self.yubico_version
    }

    pub fn pin_capabilities(&self) -> PinCapabilities {
        self.pin_capabilities
    }

    /// Begins a transaction, giving this process exclusive use of the card
    /// until [`Token::end_txn`] is called. If the resource manager reports
    /// that the card was reset while the lock was being acquired, this
    /// token's [`Token::reset_observed`] flag is set and the call fails
    /// with [`Error::Reset`]; the caller is expected to retry after calling
    /// [`Token::select`] again (never automatically, per spec component C).
    #[instrument(skip(self))]
    pub fn begin_txn(&mut self) -> Result<()> {
        match self.conn.begin_transaction() {
            Ok(()) => {
                self.in_transaction = true;
                self.reset_observed = false;
                Ok(())
            }
            Err(Error::Reset) => {
                self.reset_observed = true;
                self.selected = false;
                self.pin_verified = false;
                self.admin_authenticated = false;
                Err(Error::Reset)
            }
            Err(e) => Err(e),
        }
    }

    /// Ends the current transaction. A `Reset` disposition also clears the
    /// post-authentication state this `Token` was tracking, since the card
    /// forgets it too.
    #[instrument(skip(self))]
    pub fn end_txn(&mut self, disposition: Disposition) -> Result<()> {
        self.conn.end_transaction(disposition)?;
        self.in_transaction = false;
        if matches!(disposition, Disposition::ResetCard) {
            self.selected = false;
            self.pin_verified = false;
            self.admin_authenticated = false;
        }
        Ok(())
    }

    /// Disconnects outright, consuming the `Token`.
    pub fn release(self, disposition: Disposition) -> Result<()> {
        self.conn.release(disposition)
    }

    /// Sends one command, transparently following `61xx` ("more data, GET
    /// RESPONSE") and `6Cxx` ("wrong length, retry with this Le") chaining
    /// until a terminal status word comes back. A card reset surfaces as
    /// [`Error::Reset`] and clears this token's authentication state.
    #[instrument(skip(self, cmd), fields(ins = %format!("{:02X}", cmd.ins)))]
    pub(crate) fn transceive_raw(&mut self, cmd: CommandApdu) -> Result<ResponseApdu> {
        self.transceive_raw_inner(cmd, true)
    }

    /// `allow_wrong_length_retry` is `false` on the recursive retry itself,
    /// so a card that answers `6Cxx` twice in a row surfaces the second
    /// status word instead of looping: per spec component C, the `6Cxx`
    /// retry happens exactly once.
    fn transceive_raw_inner(
        &mut self,
        cmd: CommandApdu,
        allow_wrong_length_retry: bool,
    ) -> Result<ResponseApdu> {
        let raw = cmd.to_bytes()?;
        let result = self.conn.transmit(&raw);
        let raw_response = match result {
            Ok(r) => r,
            Err(Error::Reset) => {
                self.selected = false;
                self.pin_verified = false;
                self.admin_authenticated = false;
                return Err(Error::Reset);
            }
            Err(e) => return Err(e),
        };
        let mut response = ResponseApdu::parse(&raw_response)?;

        if allow_wrong_length_retry {
            if let Some(correct_le) = response.correct_le() {
                debug!(le = correct_le, "resending with corrected Le");
                let retry = CommandApdu {
                    le: Some(correct_le),
                    ..cmd
                };
                return self.transceive_raw_inner(retry, false);
            }
        }

        let mut body = response.body;
        while let Some(remaining) = response.bytes_remaining() {
            let cont = CommandApdu::new(CLA_ISO, INS_CONTINUE, 0x00, 0x00, Vec::new())
                .with_le(remaining);
            let raw = self.conn.transmit(&cont.to_bytes()?)?;
            response = ResponseApdu::parse(&raw)?;
            body.extend_from_slice(&response.body);
        }

        Ok(ResponseApdu {
            body,
            sw: response.sw,
        })
    }

    /// Sends `cmd`, returning its body on success or the classified error
    /// otherwise (via [`ResponseApdu::classify`]).
    pub(crate) fn transceive(&mut self, cmd: CommandApdu, context: &str) -> Result<Vec<u8>> {
        self.transceive_raw(cmd)?.into_result(context)
    }

    /// Command-chains `data` across multiple APDUs when it exceeds 255
    /// bytes (e.g. a PUT DATA carrying a full certificate), using class
    /// byte `0x10` on every APDU but the last.
    pub(crate) fn transceive_chain(
        &mut self,
        ins: u8,
        p1: u8,
        p2: u8,
        data: &[u8],
        context: &str,
    ) -> Result<Vec<u8>> {
        const CHUNK: usize = 0xFF;
        if data.is_empty() {
            return self.transceive(CommandApdu::new(CLA_ISO, ins, p1, p2, Vec::new()), context);
        }
        let chunks: Vec<&[u8]> = data.chunks(CHUNK).collect();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let cla = if i == last { CLA_ISO } else { CLA_CHAIN };
            let cmd = CommandApdu::new(cla, ins, p1, p2, chunk.to_vec());
            if i == last {
                return self.transceive(cmd, context);
            }
            self.transceive(cmd, context)?;
        }
        unreachable!("chunks is non-empty, loop always returns on the last iteration")
    }

    /// Generic GET DATA by raw tag: sends `CLA=00 INS=CB P1=3F P2=FF` with
    /// body `TLV(0x5C, tag)`, returning the raw response body. This is the
    /// primitive `read_cert`, CHUID/discovery/key-history reads, and any
    /// caller-supplied tag all go through (see DESIGN.md, "generic data
    /// object access").
    pub fn get_data(&mut self, tag_list_value: &[u8]) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        encode_tlv(&mut body, crate::constants::TAG_GET_DATA_TAG_LIST, tag_list_value);
        self.transceive(
            CommandApdu::new(CLA_ISO, INS_GET_DATA, 0x3F, 0xFF, body).with_le(0x00),
            "GET DATA",
        )
    }

    /// Generic PUT DATA by raw tag: packages `value` as `TLV(0x5C, tag) ||
    /// TLV(0x53, value)` and sends it, chaining across multiple APDUs if
    /// needed. Requires prior admin authentication, same as the card does.
    pub fn put_data(&mut self, tag: &[u8], value: &[u8]) -> Result<()> {
        let mut data = Vec::new();
        encode_tlv(&mut data, crate::constants::TAG_GET_DATA_TAG_LIST, tag);
        encode_tlv(&mut data, crate::constants::TAG_CONTAINER, value);
        self.transceive_chain(INS_PUT_DATA, 0x3F, 0xFF, &data, "PUT DATA")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::INS_SELECT;
    use crate::transport::mock::MockCard;
    use crate::transport::{CardProtocol, ReaderBackend, ShareMode};

    fn token_over(card: MockCard) -> Token<crate::transport::mock::MockConnection> {
        let backend = card.into_backend();
        let conn = backend
            .connect("Mock", ShareMode::Shared, &[CardProtocol::T1])
            .unwrap();
        Token::new(conn, ClientConfig::default(), "Mock".to_string())
    }

    #[test]
    fn begin_txn_reset_then_successful_retry() {
        let card = MockCard::new();
        card.inject_reset();
        let mut token = token_over(card);

        let err = token.begin_txn().unwrap_err();
        assert!(matches!(err, Error::Reset));
        assert!(token.reset_observed());
        assert!(!token.in_transaction);

        // Caller retries begin_txn after observing the reset; this time it
        // succeeds and the reset flag clears.
        token.begin_txn().unwrap();
        assert!(!token.reset_observed());
        assert!(token.in_transaction);
    }

    #[test]
    fn transceive_chain_splits_outbound_body_with_chaining_bit() {
        let card = MockCard::new();
        // Two 255-byte chunks plus a 10-byte remainder: the first two
        // outbound frames carry class 0x10 (chaining), the last carries
        // the plain ISO class.
        card.push_response(CLA_CHAIN, 0xDB, 0x3F, 0xFF, vec![0x90, 0x00]);
        card.push_response(CLA_CHAIN, 0xDB, 0x3F, 0xFF, vec![0x90, 0x00]);
        card.push_response(CLA_ISO, 0xDB, 0x3F, 0xFF, vec![0x90, 0x00]);
        let mut token = token_over(card.clone());

        let data = vec![0xAB; 520];
        token.transceive_chain(0xDB, 0x3F, 0xFF, &data, "PUT DATA").unwrap();

        let commands = card.commands();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0][0], CLA_CHAIN);
        assert_eq!(commands[1][0], CLA_CHAIN);
        assert_eq!(commands[2][0], CLA_ISO);
        // chunk sizes: 255, 255, 10
        assert_eq!(commands[0][4], 0xFF);
        assert_eq!(commands[1][4], 0xFF);
        assert_eq!(commands[2][4], 10);
    }

    #[test]
    fn get_response_continuation_concatenates_bodies() {
        let card = MockCard::new();
        card.push_response(CLA_ISO, INS_SELECT, 0x04, 0x00, vec![0x61, 0x02, 0xAA, 0xBB]);
        card.push_response(0x00, 0xC0, 0x00, 0x00, vec![0xCC, 0xDD, 0x90, 0x00]);
        let mut token = token_over(card);

        let cmd = CommandApdu::new(CLA_ISO, INS_SELECT, 0x04, 0x00, Vec::new()).with_le(0x00);
        let body = token.transceive(cmd, "SELECT").unwrap();
        assert_eq!(body, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn wrong_length_retries_exactly_once_with_corrected_le() {
        let card = MockCard::new();
        card.push_response(CLA_ISO, INS_SELECT, 0x04, 0x00, vec![0x6C, 0x10]);
        card.push_response(CLA_ISO, INS_SELECT, 0x04, 0x00, vec![0x90, 0x00]);
        let mut token = token_over(card.clone());

        let cmd = CommandApdu::new(CLA_ISO, INS_SELECT, 0x04, 0x00, Vec::new()).with_le(0x00);
        token.transceive(cmd, "SELECT").unwrap();

        let commands = card.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(*commands[1].last().unwrap(), 0x10); // retried with corrected Le
    }
}
