//! An in-memory stand-in for a PC/SC reader and card, used by the scenario
//! and property tests. Not a hardware simulator: it answers canned or
//! programmatically-generated responses keyed by `(CLA, INS, P1, P2)`
//! rather than modeling applet state, the way `MockYubiKey` in the Barqly
//! test suite answers canned responses for higher-level operations.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::transport::{CardConnection, CardProtocol, Disposition, ReaderBackend, ShareMode};

/// How a scripted entry produces its response bytes.
enum ResponseSource {
    /// A fixed response, returned verbatim.
    Fixed(Vec<u8>),
    /// A response computed from the full outgoing command (including
    /// header), for handshakes like admin auth where the card's answer
    /// depends on a host-generated random challenge.
    Dynamic(Box<dyn Fn(&[u8]) -> Vec<u8> + Send>),
}

/// A single scripted response to a command matched by its header bytes.
struct ScriptedResponse {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    source: ResponseSource,
}

/// Shared state behind a [`MockCard`]: the script, a record of every
/// command received (for assertions), and whether the next transmit should
/// report a card reset instead of answering.
#[derive(Default)]
struct MockState {
    script: VecDeque<ScriptedResponse>,
    log: Vec<Vec<u8>>,
    inject_reset: bool,
    in_transaction: bool,
}

/// An in-memory card. Cheaply cloneable; clones share the same script and
/// call log, so a test can hold one handle to assert on while the backend
/// hands out connections.
#[derive(Clone, Default)]
pub struct MockCard {
    state: Arc<Mutex<MockState>>,
}

impl MockCard {
    pub fn new() -> Self {
        MockCard::default()
    }

    /// Queues one fixed response, to be returned in FIFO order as matching
    /// commands are transmitted.
    pub fn push_response(&self, cla: u8, ins: u8, p1: u8, p2: u8, response: Vec<u8>) {
        self.state.lock().unwrap().script.push_back(ScriptedResponse {
            cla,
            ins,
            p1,
            p2,
            source: ResponseSource::Fixed(response),
        });
    }

    /// Queues a response computed from the outgoing command bytes, for
    /// scripting a card's side of a challenge-response handshake where the
    /// challenge is generated by the code under test.
    pub fn push_responder(
        &self,
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        f: impl Fn(&[u8]) -> Vec<u8> + Send + 'static,
    ) {
        self.state.lock().unwrap().script.push_back(ScriptedResponse {
            cla,
            ins,
            p1,
            p2,
            source: ResponseSource::Dynamic(Box::new(f)),
        });
    }

    /// Causes the next `begin_transaction` or `transmit` to fail with
    /// [`Error::Reset`] instead of succeeding/consuming from the script.
    pub fn inject_reset(&self) {
        self.state.lock().unwrap().inject_reset = true;
    }

    /// Every command transmitted so far, in order, full APDU bytes.
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn into_backend(self) -> MockBackend {
        MockBackend { card: self }
    }
}

/// A [`ReaderBackend`] that always hands back the same [`MockCard`],
/// reporting exactly one reader.
pub struct MockBackend {
    card: MockCard,
}

impl MockBackend {
    pub fn new(card: MockCard) -> Self {
        MockBackend { card }
    }
}

impl ReaderBackend for MockBackend {
    type Connection = MockConnection;

    fn list_readers(&self) -> Result<Vec<String>> {
        Ok(vec!["Mock Reader 00 00".to_string()])
    }

    fn connect(
        &self,
        _reader: &str,
        _mode: ShareMode,
        _preferred: &[CardProtocol],
    ) -> Result<Self::Connection> {
        Ok(MockConnection {
            card: self.card.clone(),
        })
    }
}

/// A connection handle over a [`MockCard`].
pub struct MockConnection {
    card: MockCard,
}

impl CardConnection for MockConnection {
    fn begin_transaction(&mut self) -> Result<()> {
        let mut state = self.card.state.lock().unwrap();
        if state.inject_reset {
            state.inject_reset = false;
            return Err(Error::Reset);
        }
        state.in_transaction = true;
        Ok(())
    }

    fn end_transaction(&mut self, _disposition: Disposition) -> Result<()> {
        self.card.state.lock().unwrap().in_transaction = false;
        Ok(())
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.card.state.lock().unwrap();
        state.log.push(command.to_vec());

        if state.inject_reset {
            state.inject_reset = false;
            state.in_transaction = false;
            return Err(Error::Reset);
        }

        if command.len() < 4 {
            return Err(Error::invalid_data("mock received a command shorter than 4 bytes"));
        }
        let (cla, ins, p1, p2) = (command[0], command[1], command[2], command[3]);

        let idx = state
            .script
            .iter()
            .position(|r| r.cla == cla && r.ins == ins && r.p1 == p1 && r.p2 == p2);
        match idx {
            Some(i) => {
                let entry = state.script.remove(i).unwrap();
                Ok(match entry.source {
                    ResponseSource::Fixed(bytes) => bytes,
                    ResponseSource::Dynamic(f) => f(command),
                })
            }
            None => Err(Error::invalid_data(format!(
                "mock has no scripted response for CLA={cla:02X} INS={ins:02X} P1={p1:02X} P2={p2:02X}"
            ))),
        }
    }

    fn release(self, _disposition: Disposition) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_scripted_response() {
        let card = MockCard::new();
        card.push_response(0x00, 0xA4, 0x04, 0x00, vec![0x90, 0x00]);
        let backend = card.clone().into_backend();
        let mut conn = backend.connect("Mock", ShareMode::Shared, &[CardProtocol::T1]).unwrap();
        let resp = conn.transmit(&[0x00, 0xA4, 0x04, 0x00, 0x00]).unwrap();
        assert_eq!(resp, vec![0x90, 0x00]);
        assert_eq!(card.commands().len(), 1);
    }

    #[test]
    fn reset_injection_surfaces_once() {
        let card = MockCard::new();
        card.push_response(0x00, 0x20, 0x00, 0x80, vec![0x90, 0x00]);
        card.inject_reset();
        let backend = card.clone().into_backend();
        let mut conn = backend.connect("Mock", ShareMode::Shared, &[CardProtocol::T1]).unwrap();
        let first = conn.transmit(&[0x00, 0x20, 0x00, 0x80, 0x00]);
        assert!(matches!(first, Err(Error::Reset)));
        let second = conn.transmit(&[0x00, 0x20, 0x00, 0x80, 0x00]).unwrap();
        assert_eq!(second, vec![0x90, 0x00]);
    }

    #[test]
    fn unscripted_command_is_an_error() {
        let card = MockCard::new();
        let backend = card.into_backend();
        let mut conn = backend.connect("Mock", ShareMode::Shared, &[CardProtocol::T1]).unwrap();
        let result = conn.transmit(&[0x00, 0xCB, 0x3F, 0xFF, 0x00]);
        assert!(result.is_err());
    }
}
