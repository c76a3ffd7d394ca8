//! ISO 7816-4 command/response APDU encoding and status word classification.
//!
//! This module knows nothing about PC/SC, PIV tags, or TLV structure — it
//! only builds the byte layout of a command APDU and interprets the two
//! trailing status bytes of a response.

use crate::constants::sw;
use crate::error::{Error, Result};

/// A command APDU in short form only: `piv.h` itself never builds extended
/// (three-byte-length) APDUs, since plenty of PC/SC readers only pass
/// T=0 through — bodies over 255 bytes go through [`Token::transceive_chain`]
/// instead, and oversized responses come back through GET RESPONSE
/// continuation. Case 4 (Lc and Le both present) is the only shape PIV
/// needs; callers that don't need response data can leave `le` as `None`.
#[derive(Debug, Clone)]
pub struct CommandApdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    /// Expected response length. `None` omits Le; `Some(0)` requests "as
    /// much as the card wants to send" (encoded as `0x00`).
    pub le: Option<u8>,
}

impl CommandApdu {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        CommandApdu {
            cla,
            ins,
            p1,
            p2,
            data,
            le: None,
        }
    }

    pub fn with_le(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    /// Serializes this command to wire bytes. PIV payloads are always
    /// within the short-form length byte (the transport's command chaining
    /// handles anything larger by splitting across multiple short APDUs).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.data.len() > 0xFF {
            return Err(Error::invalid_data(
                "command data exceeds 255 bytes; caller must chain",
            ));
        }
        let mut out = Vec::with_capacity(5 + self.data.len() + 1);
        out.push(self.cla);
        out.push(self.ins);
        out.push(self.p1);
        out.push(self.p2);
        if !self.data.is_empty() {
            out.push(self.data.len() as u8);
            out.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            out.push(le);
        }
        Ok(out)
    }
}

/// A parsed response: the body (everything but the trailing SW1SW2) and the
/// status word itself.
#[derive(Debug, Clone)]
pub struct ResponseApdu {
    pub body: Vec<u8>,
    pub sw: u16,
}

impl ResponseApdu {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 {
            return Err(Error::invalid_data("response shorter than the status word"));
        }
        let split = raw.len() - 2;
        let sw = u16::from_be_bytes([raw[split], raw[split + 1]]);
        Ok(ResponseApdu {
            body: raw[..split].to_vec(),
            sw,
        })
    }

    pub fn is_success(&self) -> bool {
        self.sw == sw::SUCCESS
    }

    /// Bytes remaining for a GET RESPONSE continuation, if this status word
    /// is one of the `61xx` family.
    pub fn bytes_remaining(&self) -> Option<u8> {
        if self.sw & sw::BYTES_REMAINING_MASK == sw::BYTES_REMAINING {
            Some((self.sw & 0x00FF) as u8)
        } else {
            None
        }
    }

    /// Corrected Le for a `6Cxx` "wrong length" retry.
    pub fn correct_le(&self) -> Option<u8> {
        if self.sw & sw::WRONG_LENGTH_MASK == sw::WRONG_LENGTH {
            Some((self.sw & 0x00FF) as u8)
        } else {
            None
        }
    }

    /// Remaining PIN/PUK retries, if this status word is one of the `63Cx`
    /// family.
    pub fn pin_retries(&self) -> Option<u8> {
        if self.sw & sw::PIN_INCORRECT_MASK == sw::PIN_INCORRECT {
            Some((self.sw & 0x000F) as u8)
        } else {
            None
        }
    }

    /// Classifies this status word into the crate's error model, given a
    /// human-readable description of the operation that produced it. Success
    /// and the two chaining statuses (`61xx`/`6Cxx`, handled by the
    /// transport before this is ever called by protocol code) are not
    /// errors and are not covered here.
    pub fn classify(&self, context: &str) -> Error {
        if let Some(retries) = self.pin_retries() {
            return Error::AccessDenied {
                retries_remaining: Some(retries),
            };
        }
        match self.sw {
            sw::SECURITY_NOT_SATISFIED => {
                Error::permission(format!("{context}: security condition not satisfied"))
            }
            sw::AUTH_BLOCKED => Error::AccessDenied {
                retries_remaining: Some(0),
            },
            sw::FILE_NOT_FOUND => Error::not_found(format!("{context}: object not found")),
            sw::FUNC_NOT_SUPPORTED => {
                Error::not_supported(format!("{context}: function not supported"))
            }
            sw::INCORRECT_P1P2 | sw::WRONG_DATA => {
                Error::invalid_data(format!("{context}: malformed request"))
            }
            sw::CONDITIONS_NOT_SATISFIED => Error::permission(format!(
                "{context}: conditions of use not satisfied"
            )),
            other => Error::apdu(other, context.to_string()),
        }
    }

    /// Returns `Ok(())` on success, or the classified error otherwise.
    pub fn into_result(self, context: &str) -> Result<Vec<u8>> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(self.classify(context))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn encodes_case_3_without_le() {
        let cmd = CommandApdu::new(0x00, 0xA4, 0x04, 0x00, vec![0xDE, 0xAD]);
        assert_eq!(cmd.to_bytes().unwrap(), vec![0x00, 0xA4, 0x04, 0x00, 0x02, 0xDE, 0xAD]);
    }

    #[test]
    fn encodes_case_4_with_le() {
        let cmd = CommandApdu::new(0x00, 0xCB, 0x3F, 0xFF, vec![0x5C, 0x00]).with_le(0x00);
        assert_eq!(
            cmd.to_bytes().unwrap(),
            vec![0x00, 0xCB, 0x3F, 0xFF, 0x02, 0x5C, 0x00, 0x00]
        );
    }

    #[rstest]
    #[case(&[0x90, 0x00], true)]
    #[case(&[0x6A, 0x82], false)]
    fn success_classification(#[case] raw: &[u8], #[case] expect_ok: bool) {
        let resp = ResponseApdu::parse(raw).unwrap();
        assert_eq!(resp.is_success(), expect_ok);
    }

    #[test]
    fn decodes_pin_retries() {
        let resp = ResponseApdu::parse(&[0x63, 0xC3]).unwrap();
        assert_eq!(resp.pin_retries(), Some(3));
        assert!(matches!(
            resp.classify("VERIFY"),
            Error::AccessDenied {
                retries_remaining: Some(3)
            }
        ));
    }

    #[test]
    fn decodes_bytes_remaining() {
        let resp = ResponseApdu::parse(&[0x61, 0x1A]).unwrap();
        assert_eq!(resp.bytes_remaining(), Some(0x1A));
    }

    #[test]
    fn file_not_found_maps_to_not_found() {
        let resp = ResponseApdu::parse(&[0x6A, 0x82]).unwrap();
        assert!(matches!(resp.classify("GET DATA"), Error::NotFound(_)));
    }

    #[test]
    fn auth_blocked_maps_to_zero_retries() {
        let resp = ResponseApdu::parse(&[0x69, 0x83]).unwrap();
        assert!(matches!(
            resp.classify("VERIFY"),
            Error::AccessDenied {
                retries_remaining: Some(0)
            }
        ));
    }

    #[test]
    fn short_response_is_invalid_data() {
        assert!(ResponseApdu::parse(&[0x90]).is_err());
    }
}
