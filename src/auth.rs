//! VERIFY/CHANGE/RESET PIN and the admin (card management) mutual
//! authentication handshake. Grounded in `poc/yubikey-apdu-poc/src/apdu.rs`'s
//! `verify_pin`/`authenticate_with_algorithm` (witness extraction, TDES/AES
//! block encryption) and `piv.h`'s `piv_verify_pin`/`piv_auth_admin` doc
//! comments (canskip probe, retry-floor semantics, EPERM on key rotation).

use aes::{Aes128, Aes192, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::TdesEde3;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, instrument};
use zeroize::Zeroizing;

use crate::apdu::CommandApdu;
use crate::constants::{
    AlgorithmId, CLA_ISO, INS_CHANGE_PIN, INS_GEN_AUTH, INS_RESET_PIN, INS_SET_PIN_RETRIES,
    INS_SET_MGMT, INS_VERIFY, PinRef, SlotId, TAG_DYN_AUTH, TAG_GA_CHALLENGE, TAG_GA_RESPONSE,
    TAG_GA_WITNESS,
};
use crate::error::{Error, Result};
use crate::tlv::{encode_tlv, TlvReader};
use crate::token::Token;
use crate::transport::CardConnection;

/// Block size in bytes of `alg`'s admin-auth cipher. 3DES uses single
/// 8-byte blocks; every AES variant uses the 16-byte AES block regardless
/// of key length.
fn block_size(alg: AlgorithmId) -> Result<usize> {
    match alg {
        AlgorithmId::Tdes => Ok(8),
        AlgorithmId::Aes128 | AlgorithmId::Aes192 | AlgorithmId::Aes256 => Ok(16),
        other => Err(Error::not_supported(format!(
            "{other:?} is not an admin-auth algorithm"
        ))),
    }
}

/// A one-block ECB encrypt/decrypt under the admin key, dispatching on
/// algorithm. PIV's admin challenge-response only ever exchanges exactly
/// one block, so there's no mode beyond single-block ECB to implement.
enum AdminCipher {
    Tdes(TdesEde3),
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AdminCipher {
    fn new(alg: AlgorithmId, key: &[u8]) -> Result<Self> {
        Ok(match alg {
            AlgorithmId::Tdes => AdminCipher::Tdes(
                TdesEde3::new_from_slice(key)
                    .map_err(|_| Error::invalid_data("admin key is not a valid 24-byte 3DES key"))?,
            ),
            AlgorithmId::Aes128 => AdminCipher::Aes128(
                Aes128::new_from_slice(key)
                    .map_err(|_| Error::invalid_data("admin key is not a valid 16-byte AES-128 key"))?,
            ),
            AlgorithmId::Aes192 => AdminCipher::Aes192(
                Aes192::new_from_slice(key)
                    .map_err(|_| Error::invalid_data("admin key is not a valid 24-byte AES-192 key"))?,
            ),
            AlgorithmId::Aes256 => AdminCipher::Aes256(
                Aes256::new_from_slice(key)
                    .map_err(|_| Error::invalid_data("admin key is not a valid 32-byte AES-256 key"))?,
            ),
            other => {
                return Err(Error::not_supported(format!(
                    "{other:?} is not an admin-auth algorithm"
                )))
            }
        })
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        match self {
            AdminCipher::Tdes(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            AdminCipher::Aes128(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            AdminCipher::Aes192(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            AdminCipher::Aes256(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        match self {
            AdminCipher::Tdes(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            AdminCipher::Aes128(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            AdminCipher::Aes192(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            AdminCipher::Aes256(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
        }
    }
}

/// Right-pads an ASCII numeric PIN/PUK to exactly 8 bytes with `0xFF`, per
/// SP 800-73. Rejects PINs longer than 8 digits rather than silently
/// truncating them. Takes the PIN wrapped in a [`SecretString`], the same
/// passphrase-hygiene convention the Barqly vault crate uses for its own
/// encryption passphrases, so a caller's PIN never ends up Debug-printed
/// or logged by accident.
fn pad_pin(pin: &SecretString) -> Result<Zeroizing<[u8; 8]>> {
    let pin = pin.expose_secret();
    if !pin.is_ascii() || pin.len() > 8 {
        return Err(Error::invalid_data(
            "PIN/PUK must be at most 8 ASCII characters",
        ));
    }
    let mut buf = [0xFFu8; 8];
    buf[..pin.len()].copy_from_slice(pin.as_bytes());
    Ok(Zeroizing::new(buf))
}

impl<C: CardConnection> Token<C> {
    /// Verifies `pin_ref` against `pin`. If `canskip` is true, first probes
    /// with a zero-length VERIFY; a success response means the PIN was
    /// already verified this transaction and the real PIN is never sent.
    /// If `config.min_pin_retries` is set and the probed (or last-known)
    /// retry count would fall below it, the PIN is never attempted and
    /// [`Error::WouldLockout`] is returned instead.
    #[instrument(skip(self, pin))]
    pub fn verify_pin(&mut self, pin_ref: PinRef, pin: &SecretString, canskip: bool) -> Result<()> {
        if !pin_ref.is_supported() {
            return Err(Error::not_supported(format!(
                "{pin_ref:?} is not a supported PIN reference"
            )));
        }

        if canskip {
            let probe = CommandApdu::new(CLA_ISO, INS_VERIFY, 0x00, pin_ref.to_byte(), Vec::new());
            let resp = self.transceive_raw(probe)?;
            if resp.is_success() {
                self.pin_verified = true;
                return Ok(());
            }
            if let Some(retries) = resp.pin_retries() {
                self.pin_retries_last_seen = Some(retries);
                if let Some(floor) = self.config.min_pin_retries {
                    if retries < floor {
                        return Err(Error::WouldLockout {
                            remaining: retries,
                            floor,
                        });
                    }
                }
            }
        } else if let Some(floor) = self.config.min_pin_retries {
            if let Some(retries) = self.pin_retries_last_seen {
                if retries < floor {
                    return Err(Error::WouldLockout {
                        remaining: retries,
                        floor,
                    });
                }
            }
        }

        let padded = pad_pin(pin)?;
        let cmd = CommandApdu::new(CLA_ISO, INS_VERIFY, 0x00, pin_ref.to_byte(), padded.to_vec());
        let resp = self.transceive_raw(cmd)?;
        if resp.is_success() {
            self.pin_verified = true;
            self.pin_retries_last_seen = None;
            info!("PIN verified");
            return Ok(());
        }
        if let Some(retries) = resp.pin_retries() {
            self.pin_retries_last_seen = Some(retries);
        }
        Err(resp.classify("VERIFY"))
    }

    /// Changes `pin_ref` from `old_pin` to `new_pin` (INS 0x24, `old ||
    /// new`, each padded to 8 bytes).
    #[instrument(skip(self, old_pin, new_pin))]
    pub fn change_pin(
        &mut self,
        pin_ref: PinRef,
        old_pin: &SecretString,
        new_pin: &SecretString,
    ) -> Result<()> {
        if !pin_ref.is_supported() {
            return Err(Error::not_supported(format!(
                "{pin_ref:?} is not a supported PIN reference"
            )));
        }
        let old = pad_pin(old_pin)?;
        let new = pad_pin(new_pin)?;
        let mut body = Zeroizing::new(Vec::with_capacity(16));
        body.extend_from_slice(&*old);
        body.extend_from_slice(&*new);
        let cmd = CommandApdu::new(CLA_ISO, INS_CHANGE_PIN, 0x00, pin_ref.to_byte(), body.to_vec());
        let resp = self.transceive_raw(cmd)?;
        if resp.is_success() {
            info!("PIN changed");
            return Ok(());
        }
        Err(resp.classify("CHANGE PIN"))
    }

    /// Resets `pin_ref` to `new_pin` using the PUK (INS 0x2C, `puk ||
    /// new`).
    #[instrument(skip(self, puk, new_pin))]
    pub fn reset_pin(
        &mut self,
        pin_ref: PinRef,
        puk: &SecretString,
        new_pin: &SecretString,
    ) -> Result<()> {
        if !pin_ref.is_supported() {
            return Err(Error::not_supported(format!(
                "{pin_ref:?} is not a supported PIN reference"
            )));
        }
        let puk_padded = pad_pin(puk)?;
        let new = pad_pin(new_pin)?;
        let mut body = Zeroizing::new(Vec::with_capacity(16));
        body.extend_from_slice(&*puk_padded);
        body.extend_from_slice(&*new);
        let cmd = CommandApdu::new(CLA_ISO, INS_RESET_PIN, 0x00, pin_ref.to_byte(), body.to_vec());
        let resp = self.transceive_raw(cmd)?;
        if resp.is_success() {
            info!("PIN reset via PUK");
            return Ok(());
        }
        Err(resp.classify("RESET PIN"))
    }

    /// Authenticates as the card administrator using `key`, under
    /// `algorithm` (3DES by default; AES-128/192/256 if the card
    /// advertises it). Runs the four-step mutual challenge-response over
    /// GENERAL AUTHENTICATE against slot 9B.
    #[instrument(skip(self, key))]
    pub fn auth_admin(&mut self, algorithm: AlgorithmId, key: &[u8]) -> Result<()> {
        let block_len = block_size(algorithm)?;
        let cipher = AdminCipher::new(algorithm, key)?;

        // Step 1: ask for a witness.
        let mut req1 = Vec::new();
        let mut inner1 = Vec::new();
        encode_tlv(&mut inner1, TAG_GA_WITNESS, &[]);
        encode_tlv(&mut req1, TAG_DYN_AUTH, &inner1);
        let cmd1 = CommandApdu::new(
            CLA_ISO,
            INS_GEN_AUTH,
            algorithm.to_byte(),
            SlotId::CardManagement.to_byte(),
            req1,
        )
        .with_le(0x00);
        let body1 = self.transceive(cmd1, "GENERAL AUTHENTICATE (witness)")?;

        let outer = TlvReader::new(&body1).read_one()?;
        if outer.tag != TAG_DYN_AUTH {
            return Err(Error::invalid_data("admin auth: missing dynamic auth template"));
        }
        let witness_ct = TlvReader::find(&outer.value, TAG_GA_WITNESS)?
            .ok_or_else(|| Error::invalid_data("admin auth: card returned no witness"))?;
        if witness_ct.len() != block_len {
            return Err(Error::invalid_data("admin auth: witness has unexpected length"));
        }

        let mut witness = Zeroizing::new(witness_ct.clone());
        cipher.decrypt_block(&mut witness);

        // Step 2/3: prove we decrypted the witness, and challenge the card
        // in turn.
        let mut challenge = Zeroizing::new(vec![0u8; block_len]);
        rand::thread_rng().fill_bytes(&mut challenge);

        let mut req2 = Vec::new();
        let mut inner2 = Vec::new();
        encode_tlv(&mut inner2, TAG_GA_WITNESS, &witness);
        encode_tlv(&mut inner2, TAG_GA_CHALLENGE, &challenge);
        encode_tlv(&mut inner2, TAG_GA_RESPONSE, &[]);
        encode_tlv(&mut req2, TAG_DYN_AUTH, &inner2);
        let cmd2 = CommandApdu::new(
            CLA_ISO,
            INS_GEN_AUTH,
            algorithm.to_byte(),
            SlotId::CardManagement.to_byte(),
            req2,
        )
        .with_le(0x00);
        let body2 = self.transceive(cmd2, "GENERAL AUTHENTICATE (response)")?;

        let outer2 = TlvReader::new(&body2).read_one()?;
        if outer2.tag != TAG_DYN_AUTH {
            return Err(Error::invalid_data("admin auth: missing dynamic auth template"));
        }
        let response_ct = TlvReader::find(&outer2.value, TAG_GA_RESPONSE)?
            .ok_or_else(|| Error::invalid_data("admin auth: card returned no response"))?;
        if response_ct.len() != block_len {
            return Err(Error::invalid_data("admin auth: response has unexpected length"));
        }

        let mut expected = Zeroizing::new(challenge.to_vec());
        cipher.encrypt_block(&mut expected);

        if expected.as_slice() != response_ct.as_slice() {
            return Err(Error::AccessDenied {
                retries_remaining: None,
            });
        }

        self.admin_authenticated = true;
        self.admin_algorithm = algorithm;
        info!(?algorithm, "admin authenticated");
        Ok(())
    }

    /// YubicoPIV: rotates the admin key. Requires a successful
    /// [`Token::auth_admin`] earlier in this transaction, mirroring
    /// `ykpiv_set_admin`'s `EPERM` precondition.
    #[instrument(skip(self, new_key))]
    pub fn set_admin_key(&mut self, algorithm: AlgorithmId, new_key: &[u8]) -> Result<()> {
        if !self.admin_authenticated {
            return Err(Error::permission(
                "set_admin_key requires a prior auth_admin in this transaction",
            ));
        }
        let expect_len = match algorithm {
            AlgorithmId::Tdes => 24,
            AlgorithmId::Aes128 => 16,
            AlgorithmId::Aes192 => 24,
            AlgorithmId::Aes256 => 32,
            other => {
                return Err(Error::not_supported(format!(
                    "{other:?} is not an admin-key algorithm"
                )))
            }
        };
        if new_key.len() != expect_len {
            return Err(Error::invalid_data(format!(
                "{algorithm:?} admin key must be {expect_len} bytes"
            )));
        }
        let mut data = Vec::with_capacity(3 + new_key.len());
        data.push(algorithm.to_byte());
        data.push(SlotId::CardManagement.to_byte());
        data.push(new_key.len() as u8);
        data.extend_from_slice(new_key);
        let cmd = CommandApdu::new(CLA_ISO, INS_SET_MGMT, 0xFF, 0xFF, data);
        self.transceive(cmd, "SET MANAGEMENT KEY")?;
        info!(?algorithm, "admin key rotated");
        Ok(())
    }

    /// YubicoPIV: changes the maximum PIN/PUK retry counts, resetting both
    /// to their defaults. Requires both `auth_admin` and `verify_pin` in
    /// this transaction.
    #[instrument(skip(self))]
    pub fn set_pin_retries(&mut self, pin_tries: u8, puk_tries: u8) -> Result<()> {
        if !self.admin_authenticated || !self.pin_verified {
            return Err(Error::permission(
                "set_pin_retries requires both auth_admin and verify_pin in this transaction",
            ));
        }
        let cmd = CommandApdu::new(CLA_ISO, INS_SET_PIN_RETRIES, pin_tries, puk_tries, Vec::new());
        self.transceive(cmd, "SET PIN RETRIES")?;
        info!(pin_tries, puk_tries, "PIN/PUK retry counts updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::mock::MockCard;
    use crate::transport::{CardProtocol, ReaderBackend, ShareMode};

    fn token_over(card: MockCard) -> Token<crate::transport::mock::MockConnection> {
        let backend = card.into_backend();
        let conn = backend
            .connect("Mock", ShareMode::Shared, &[CardProtocol::T1])
            .unwrap();
        Token::new(conn, ClientConfig::default(), "Mock".to_string())
    }

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn canskip_probe_success_sets_verified_without_sending_pin() {
        let card = MockCard::new();
        card.push_response(0x00, 0x20, 0x00, 0x80, vec![0x90, 0x00]);
        let mut token = token_over(card.clone());
        token
            .verify_pin(PinRef::Application, &secret("123456"), true)
            .unwrap();
        assert!(token.is_pin_verified());
        assert_eq!(card.commands().len(), 1);
        assert_eq!(card.commands()[0].len(), 4); // zero-length probe, no Lc/data
    }

    #[test]
    fn incorrect_pin_reports_remaining_retries() {
        let card = MockCard::new();
        card.push_response(0x00, 0x20, 0x00, 0x80, vec![0x63, 0xC2]); // probe
        card.push_response(0x00, 0x20, 0x00, 0x80, vec![0x63, 0xC1]); // real attempt
        let mut token = token_over(card);
        let err = token
            .verify_pin(PinRef::Application, &secret("000000"), true)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::AccessDenied {
                retries_remaining: Some(1)
            }
        ));
    }

    #[test]
    fn would_lockout_skips_the_attempt_entirely() {
        let card = MockCard::new();
        card.push_response(0x00, 0x20, 0x00, 0x80, vec![0x63, 0xC1]); // probe: 1 left
        let mut token = token_over(card.clone());
        token.config.min_pin_retries = Some(2);
        let err = token
            .verify_pin(PinRef::Application, &secret("123456"), true)
            .unwrap_err();
        assert!(matches!(err, Error::WouldLockout { remaining: 1, floor: 2 }));
        // Only the probe was sent; the real PIN never went over the wire.
        assert_eq!(card.commands().len(), 1);
    }

    #[test]
    fn occ_pin_ref_is_not_supported() {
        let card = MockCard::new();
        let mut token = token_over(card);
        let err = token
            .verify_pin(PinRef::Occ, &secret("1234"), false)
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn admin_auth_round_trip_with_tdes() {
        let key = [0x11u8; 24];
        let cipher = AdminCipher::new(AlgorithmId::Tdes, &key).unwrap();
        let witness_plain = [0x22u8; 8];
        let mut witness_ct = witness_plain;
        cipher.encrypt_block(&mut witness_ct);

        let card = MockCard::new();
        let mut resp1 = Vec::new();
        let mut inner1 = Vec::new();
        encode_tlv(&mut inner1, TAG_GA_WITNESS, &witness_ct);
        encode_tlv(&mut resp1, TAG_DYN_AUTH, &inner1);
        resp1.extend_from_slice(&[0x90, 0x00]);
        card.push_response(0x00, 0x87, 0x03, 0x9B, resp1);

        // The host picks its own random challenge, so the card's step-2
        // answer is computed from the outgoing command rather than scripted
        // up front.
        let key_for_responder = key;
        card.push_responder(0x00, 0x87, 0x03, 0x9B, move |raw_cmd| {
            let cipher = AdminCipher::new(AlgorithmId::Tdes, &key_for_responder).unwrap();
            // raw_cmd = CLA INS P1 P2 Lc 7C <len> 80 08 <witness> 81 08 <challenge> 82 00
            let lc = raw_cmd[4] as usize;
            let body = &raw_cmd[5..5 + lc];
            let outer = TlvReader::new(body).read_one().unwrap();
            let challenge = TlvReader::find(&outer.value, TAG_GA_CHALLENGE)
                .unwrap()
                .unwrap();
            let mut response_ct = challenge.clone();
            cipher.encrypt_block(&mut response_ct);
            let mut resp = Vec::new();
            let mut inner = Vec::new();
            encode_tlv(&mut inner, TAG_GA_RESPONSE, &response_ct);
            encode_tlv(&mut resp, TAG_DYN_AUTH, &inner);
            resp.extend_from_slice(&[0x90, 0x00]);
            resp
        });

        let mut token = token_over(card);
        token.auth_admin(AlgorithmId::Tdes, &key).unwrap();
        assert!(token.is_admin_authenticated());
    }

    #[test]
    fn admin_auth_mismatch_is_access_denied() {
        let key = [0x11u8; 24];
        let cipher = AdminCipher::new(AlgorithmId::Tdes, &key).unwrap();
        let mut witness_ct = [0x22u8; 8];
        cipher.encrypt_block(&mut witness_ct);

        let card = MockCard::new();
        let mut resp1 = Vec::new();
        let mut inner1 = Vec::new();
        encode_tlv(&mut inner1, TAG_GA_WITNESS, &witness_ct);
        encode_tlv(&mut resp1, TAG_DYN_AUTH, &inner1);
        resp1.extend_from_slice(&[0x90, 0x00]);
        card.push_response(0x00, 0x87, 0x03, 0x9B, resp1);

        // Card answers with garbage instead of the correctly encrypted
        // challenge.
        card.push_responder(0x00, 0x87, 0x03, 0x9B, |_raw_cmd| {
            let mut resp = Vec::new();
            let mut inner = Vec::new();
            encode_tlv(&mut inner, TAG_GA_RESPONSE, &[0xAAu8; 8]);
            encode_tlv(&mut resp, TAG_DYN_AUTH, &inner);
            resp.extend_from_slice(&[0x90, 0x00]);
            resp
        });

        let mut token = token_over(card);
        let err = token.auth_admin(AlgorithmId::Tdes, &key).unwrap_err();
        assert!(matches!(err, Error::AccessDenied { .. }));
        assert!(!token.is_admin_authenticated());
    }
}
