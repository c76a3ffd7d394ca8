//! Reader enumeration, applet selection, and the card-discovery reads
//! (Application Property Template, discovery object, CHUID, key history,
//! Yubico version probe). Grounded in `poc/yubikey-apdu-poc/src/apdu.rs`'s
//! `select_piv_application` and in `piv.h`'s `piv_enumerate` doc comment.

use tracing::{info, instrument, warn};

use crate::apdu::CommandApdu;
use crate::config::ClientConfig;
use crate::constants::{
    AlgorithmId, CLA_ISO, INS_GET_VERSION, INS_SELECT, PIV_AID, SEL_APP_AID, TAG_AID, TAG_ALGS,
    TAG_ALG_ID, TAG_APP_LABEL, TAG_APT, TAG_CARDCAP, TAG_CHUID, TAG_CHUID_EXPIRY, TAG_CHUID_FASCN,
    TAG_CHUID_GUID, TAG_CHUID_SIGNATURE, TAG_DISCOVERY, TAG_DISCOVERY_AID, TAG_DISCOVERY_POLICY,
    TAG_KEYHIST, TAG_KEYHIST_OFFCARD, TAG_KEYHIST_ONCARD, TAG_KEYHIST_URL, TAG_SECOBJ, TAG_URI,
};
use crate::error::{Error, Result};
use crate::tlv::TlvReader;
use crate::token::Token;
use crate::transport::{CardConnection, CardProtocol, Disposition, ReaderBackend, ShareMode};

/// Lists every reader name visible to `backend`.
pub fn enumerate_readers<B: ReaderBackend>(backend: &B) -> Result<Vec<String>> {
    backend.list_readers()
}

/// Connects to `reader` and selects the PIV applet, returning a `Token`
/// with its discovery data populated. A token whose mandatory steps
/// (SELECT itself) fail is not returned; an error from an optional step
/// (key history, Yubico version) is logged and does not abort discovery.
#[instrument(skip(backend, config))]
pub fn discover_one<B: ReaderBackend>(
    backend: &B,
    reader: &str,
    config: &ClientConfig,
) -> Result<Token<B::Connection>> {
    let conn = backend.connect(reader, config.share_mode, &config.preferred_protocols)?;
    let mut token = Token::new(conn, config.clone(), reader.to_string());
    token.select()?;
    Ok(token)
}

/// Connects to and selects every reader `backend` reports, dropping (and
/// logging) any that fails a mandatory step.
pub fn enumerate<B: ReaderBackend>(backend: &B, config: &ClientConfig) -> Vec<Token<B::Connection>> {
    let readers = match enumerate_readers(backend) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "failed to list readers");
            return Vec::new();
        }
    };
    let mut tokens = Vec::new();
    for reader in readers {
        match discover_one(backend, &reader, config) {
            Ok(t) => tokens.push(t),
            Err(e) => warn!(reader, error = %e, "dropping token: discovery failed"),
        }
    }
    tokens
}

impl<C: CardConnection> Token<C> {
    /// SELECTs the PIV applet, parses the Application Property Template,
    /// and reads the discovery/CHUID/key-history objects and the Yubico
    /// version. Idempotent: safe to call again after a reset.
    #[instrument(skip(self))]
    pub fn select(&mut self) -> Result<()> {
        let cmd = CommandApdu::new(CLA_ISO, INS_SELECT, SEL_APP_AID, 0x00, PIV_AID.to_vec())
            .with_le(0x00);
        let body = self.transceive(cmd, "SELECT")?;
        self.selected = true;

        let apt = TlvReader::find(&body, TAG_APT)?
            .ok_or_else(|| Error::invalid_data("SELECT response missing Application Property Template"))?;
        let children = TlvReader::new(&apt).read_all()?;
        for node in &children {
            match node.tag {
                TAG_ALGS => {
                    for alg_node in node.children()? {
                        if alg_node.tag == TAG_ALG_ID {
                            if let Some(&b) = alg_node.value.first() {
                                if let Some(alg) = AlgorithmId::from_byte(b) {
                                    self.algorithms.push(alg);
                                }
                            }
                        }
                    }
                }
                TAG_AID => self.aid = node.value.clone(),
                TAG_APP_LABEL => {
                    self.app_label = Some(String::from_utf8_lossy(&node.value).into_owned())
                }
                TAG_URI => self.app_uri = Some(String::from_utf8_lossy(&node.value).into_owned()),
                _ => {}
            }
        }

        if let Err(e) = self.read_discovery_object() {
            warn!(error = %e, "discovery object read failed");
        }
        if let Err(e) = self.read_chuid() {
            warn!(error = %e, "CHUID read failed");
            self.chuid_missing = true;
        }
        if let Err(e) = self.read_key_history() {
            warn!(error = %e, "key history read failed");
        }
        self.probe_yubico_version();

        info!(guid = %hex::encode(self.guid), yubico = self.is_yubico, "token selected");
        Ok(())
    }

    fn read_discovery_object(&mut self) -> Result<()> {
        let body = self.get_data(&[(TAG_DISCOVERY >> 8) as u8, TAG_DISCOVERY as u8])?;
        let node = TlvReader::new(&body).read_one()?;
        if node.tag != TAG_DISCOVERY {
            return Err(Error::invalid_data("discovery object has unexpected outer tag"));
        }
        for child in node.children()? {
            match child.tag {
                TAG_DISCOVERY_AID if child.value.as_slice() != PIV_AID => {
                    return Err(Error::invalid_data("discovery object AID mismatch"));
                }
                TAG_DISCOVERY_POLICY => {
                    // PIN Usage Policy, first byte: bit 0x40 app PIN, 0x20
                    // global PIN, 0x10 on-card biometric, 0x08 VCI
                    // implemented. Second byte is the pairing-code reference
                    // and isn't surfaced here. Matches `piv.h`'s
                    // `pt_pin_app`/`pt_pin_global`/`pt_occ`/`pt_vci` fields.
                    if let Some(&byte) = child.value.first() {
                        self.pin_capabilities.application_pin = byte & 0x40 != 0;
                        self.pin_capabilities.global_pin = byte & 0x20 != 0;
                        self.pin_capabilities.on_card_biometric = byte & 0x10 != 0;
                        self.pin_capabilities.virtual_contact_interface = byte & 0x08 != 0;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn read_chuid(&mut self) -> Result<()> {
        let tag_bytes = TAG_CHUID.to_be_bytes();
        let body = self.get_data(&tag_bytes[1..])?;
        let container = TlvReader::new(&body).read_all()?;

        for node in &container {
            match node.tag {
                TAG_CHUID_FASCN => self.fasc_n = node.value.clone(),
                TAG_CHUID_GUID => {
                    if node.value.len() == 16 {
                        self.guid.copy_from_slice(&node.value);
                    }
                }
                TAG_CHUID_EXPIRY => {
                    if node.value.len() == 8 {
                        self.expiry.copy_from_slice(&node.value);
                    }
                }
                TAG_CHUID_SIGNATURE => self.chuid_signed = !node.value.is_empty(),
                _ => {}
            }
        }
        self.chuid_missing = false;
        Ok(())
    }

    fn read_key_history(&mut self) -> Result<()> {
        let tag_bytes = TAG_KEYHIST.to_be_bytes();
        let body = self.get_data(&tag_bytes[1..])?;
        for node in TlvReader::new(&body).read_all()? {
            match node.tag {
                TAG_KEYHIST_ONCARD => self.keyhist_on_card = node.value.first().copied().unwrap_or(0),
                TAG_KEYHIST_OFFCARD => {
                    self.keyhist_off_card = node.value.first().copied().unwrap_or(0)
                }
                TAG_KEYHIST_URL => {
                    self.keyhist_url = Some(String::from_utf8_lossy(&node.value).into_owned())
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn probe_yubico_version(&mut self) {
        let cmd = CommandApdu::new(CLA_ISO, INS_GET_VERSION, 0x00, 0x00, Vec::new()).with_le(0x00);
        match self.transceive(cmd, "GET VERSION") {
            Ok(body) if body.len() >= 3 => {
                self.is_yubico = true;
                self.yubico_version = Some([body[0], body[1], body[2]]);
            }
            _ => {
                self.is_yubico = false;
                self.yubico_version = None;
            }
        }
    }

    /// Reads the card capability container, used as a fallback source for
    /// GUID/FASC-N when the CHUID object alone doesn't carry them.
    pub fn read_card_capability_container(&mut self) -> Result<Vec<u8>> {
        let tag_bytes = TAG_CARDCAP.to_be_bytes();
        self.get_data(&tag_bytes[1..])
    }

    /// Reads the security object (CCC's signature-over-CHUID companion).
    pub fn read_security_object(&mut self) -> Result<Vec<u8>> {
        let tag_bytes = TAG_SECOBJ.to_be_bytes();
        self.get_data(&tag_bytes[1..])
    }

    /// Drops the connection. `begin_txn` was never matched by `end_txn` if
    /// `in_transaction` is still set; callers should prefer `end_txn` then
    /// `release` over relying on this path.
    pub fn disconnect(self) -> Result<()> {
        self.release(Disposition::LeaveCard)
    }
}

/// Default protocol preference used when a caller doesn't supply one.
pub fn default_protocol_preference() -> Vec<CardProtocol> {
    vec![CardProtocol::T1, CardProtocol::T0]
}

/// Default share mode used when a caller doesn't supply one.
pub fn default_share_mode() -> ShareMode {
    ShareMode::Shared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::constants::{AlgorithmId, CLA_ISO, INS_GET_DATA};
    use crate::tlv::encode_tlv;
    use crate::transport::mock::MockCard;
    use crate::transport::{CardProtocol, ReaderBackend, ShareMode};

    fn token_over(card: MockCard) -> Token<crate::transport::mock::MockConnection> {
        let backend = card.into_backend();
        let conn = backend
            .connect("Mock", ShareMode::Shared, &[CardProtocol::T1])
            .unwrap();
        Token::new(conn, ClientConfig::default(), "Mock".to_string())
    }

    fn ok(body: &[u8]) -> Vec<u8> {
        let mut resp = body.to_vec();
        resp.extend_from_slice(&[0x90, 0x00]);
        resp
    }

    #[test]
    fn select_parses_apt_aid_label_uri_and_algorithms() {
        let mut algs = Vec::new();
        encode_tlv(&mut algs, TAG_ALG_ID, &[AlgorithmId::EccP256.to_byte()]);
        encode_tlv(&mut algs, TAG_ALG_ID, &[AlgorithmId::Rsa2048.to_byte()]);

        let mut apt = Vec::new();
        encode_tlv(&mut apt, TAG_AID, PIV_AID);
        encode_tlv(&mut apt, TAG_APP_LABEL, b"PIV Card");
        encode_tlv(&mut apt, TAG_URI, b"https://example.com/piv");
        encode_tlv(&mut apt, TAG_ALGS, &algs);
        let mut select_body = Vec::new();
        encode_tlv(&mut select_body, TAG_APT, &apt);

        let mut discovery = Vec::new();
        encode_tlv(&mut discovery, TAG_DISCOVERY_AID, PIV_AID);
        encode_tlv(&mut discovery, TAG_DISCOVERY_POLICY, &[0x60, 0x00]);
        let mut discovery_obj = Vec::new();
        encode_tlv(&mut discovery_obj, TAG_DISCOVERY, &discovery);

        let mut chuid = Vec::new();
        encode_tlv(&mut chuid, TAG_CHUID_GUID, &[0xAB; 16]);
        let mut chuid_obj = Vec::new();
        encode_tlv(&mut chuid_obj, TAG_CHUID, &chuid);

        let mut keyhist = Vec::new();
        encode_tlv(&mut keyhist, TAG_KEYHIST_ONCARD, &[2]);
        let mut keyhist_obj = Vec::new();
        encode_tlv(&mut keyhist_obj, TAG_KEYHIST, &keyhist);

        let card = MockCard::new();
        card.push_response(CLA_ISO, INS_SELECT, SEL_APP_AID, 0x00, ok(&select_body));
        card.push_response(CLA_ISO, INS_GET_DATA, 0x3F, 0xFF, ok(&discovery_obj));
        card.push_response(CLA_ISO, INS_GET_DATA, 0x3F, 0xFF, ok(&chuid_obj));
        card.push_response(CLA_ISO, INS_GET_DATA, 0x3F, 0xFF, ok(&keyhist_obj));
        // No GET VERSION scripted: probe_yubico_version's error is swallowed.

        let mut token = token_over(card);
        token.select().unwrap();

        assert_eq!(token.aid(), PIV_AID);
        assert_eq!(token.app_label(), Some("PIV Card"));
        assert_eq!(token.app_uri(), Some("https://example.com/piv"));
        assert_eq!(
            token.algorithms(),
            &[AlgorithmId::EccP256, AlgorithmId::Rsa2048]
        );
        assert_eq!(token.guid(), [0xAB; 16]);
        assert_eq!(token.keyhist_on_card, 2);
        assert!(!token.is_yubico());

        let caps = token.pin_capabilities();
        assert!(caps.application_pin);
        assert!(caps.global_pin);
        assert!(!caps.on_card_biometric);
        assert!(!caps.virtual_contact_interface);
    }

    #[test]
    fn read_discovery_object_rejects_aid_mismatch() {
        let mut discovery = Vec::new();
        encode_tlv(&mut discovery, TAG_DISCOVERY_AID, b"not the piv aid");
        let mut discovery_obj = Vec::new();
        encode_tlv(&mut discovery_obj, TAG_DISCOVERY, &discovery);

        let mut apt = Vec::new();
        encode_tlv(&mut apt, TAG_AID, PIV_AID);
        let mut select_body = Vec::new();
        encode_tlv(&mut select_body, TAG_APT, &apt);

        let card = MockCard::new();
        card.push_response(CLA_ISO, INS_SELECT, SEL_APP_AID, 0x00, ok(&select_body));
        card.push_response(CLA_ISO, INS_GET_DATA, 0x3F, 0xFF, ok(&discovery_obj));

        let mut token = token_over(card);
        // select() logs-and-continues past an optional-step failure rather
        // than failing outright; it still succeeds overall.
        token.select().unwrap();
        assert_eq!(token.pin_capabilities().application_pin, false);
    }
}
