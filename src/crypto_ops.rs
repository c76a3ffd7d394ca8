//! On-card cryptographic operations: signing (pre-hashed and hash-on-card),
//! ECDH, asymmetric key generation, certificate loading, proof-of-possession,
//! and attestation. All share the GENERAL AUTHENTICATE envelope; grounded in
//! `piv.h`'s `piv_sign*`/`piv_ecdh`/`piv_generate`/`ykpiv_generate`/
//! `piv_auth_key`/`ykpiv_attest` doc comments.

use rand::RngCore;
use rsa::traits::PublicKeyParts;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::instrument;

use crate::apdu::CommandApdu;
use zeroize::Zeroizing;

use crate::constants::{
    AlgorithmId, CLA_ISO, INS_ATTEST, INS_GEN_ASYM, INS_GEN_AUTH, INS_IMPORT_ASYM, PinPolicy,
    SlotId, TAG_DYN_AUTH, TAG_EC_POINT, TAG_GA_CHALLENGE, TAG_GA_EXPONENTIATION, TAG_GA_RESPONSE,
    TAG_GEN_ALGORITHM, TAG_GEN_PIN_POLICY, TAG_GEN_TOUCH_POLICY, TAG_IMPORT_EC_PRIVATE,
    TAG_IMPORT_RSA_DP, TAG_IMPORT_RSA_DQ, TAG_IMPORT_RSA_P, TAG_IMPORT_RSA_Q, TAG_IMPORT_RSA_QINV,
    TAG_PUBKEY_WRAPPER, TAG_RSA_EXPONENT, TAG_RSA_MODULUS, TouchPolicy,
};
use crate::error::{Error, Result};
use crate::slot::{Slot, SlotPublicKey};
use crate::tlv::{encode_tlv, TlvReader};
use crate::token::Token;
use crate::transport::CardConnection;

/// Raw private key material for [`Token::import_key`]. Every field is
/// zeroized on drop; none of it is ever logged.
pub enum PrivateKeyMaterial {
    /// RSA CRT components, each a big-endian unsigned integer the size of
    /// one half of the modulus (e.g. 128 bytes each for RSA-2048).
    Rsa {
        p: Zeroizing<Vec<u8>>,
        q: Zeroizing<Vec<u8>>,
        dp: Zeroizing<Vec<u8>>,
        dq: Zeroizing<Vec<u8>>,
        qinv: Zeroizing<Vec<u8>>,
    },
    /// Raw EC private scalar, big-endian, the width of the curve's order
    /// (32 bytes for P-256, 48 for P-384).
    Ec(Zeroizing<Vec<u8>>),
}

/// A card's GENERATE request uses the same tag (0xAC) SELECT's Application
/// Property Template uses for its algorithm list; the two have nothing to
/// do with each other beyond sharing a byte value in the standard.
const TAG_GEN_CONTROL_TEMPLATE: u32 = 0xAC;

/// Digest algorithm used to prepare a payload for signing. For RSA this
/// also selects the EMSA-PKCS1-v1.5 DigestInfo prefix; for ECDSA it's
/// informational only (the digest bytes are sent as-is).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlg::Sha1 => Sha1::digest(data).to_vec(),
            HashAlg::Sha256 => Sha256::digest(data).to_vec(),
            HashAlg::Sha384 => Sha384::digest(data).to_vec(),
            HashAlg::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// The DER-encoded `AlgorithmIdentifier` prefix of an EMSA-PKCS1-v1.5
    /// `DigestInfo` for this hash, per RFC 8017 appendix B.1.
    fn digest_info_prefix(self) -> &'static [u8] {
        match self {
            HashAlg::Sha1 => &[
                0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04,
                0x14,
            ],
            HashAlg::Sha256 => &[
                0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x01, 0x05, 0x00, 0x04, 0x20,
            ],
            HashAlg::Sha384 => &[
                0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x02, 0x05, 0x00, 0x04, 0x30,
            ],
            HashAlg::Sha512 => &[
                0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x03, 0x05, 0x00, 0x04, 0x40,
            ],
        }
    }
}

/// Builds an EMSA-PKCS1-v1.5 encoded message: `00 01 FF..FF 00 DigestInfo`,
/// padded to exactly `key_size` bytes.
fn emsa_pkcs1v15(hash_alg: HashAlg, digest: &[u8], key_size: usize) -> Result<Vec<u8>> {
    let prefix = hash_alg.digest_info_prefix();
    let t_len = prefix.len() + digest.len();
    if key_size < t_len + 11 {
        return Err(Error::invalid_data(
            "RSA key is too small to hold this hash's DigestInfo",
        ));
    }
    let ps_len = key_size - t_len - 3;
    let mut em = Vec::with_capacity(key_size);
    em.push(0x00);
    em.push(0x01);
    em.extend(std::iter::repeat(0xFFu8).take(ps_len));
    em.push(0x00);
    em.extend_from_slice(prefix);
    em.extend_from_slice(digest);
    Ok(em)
}

impl<C: CardConnection> Token<C> {
    fn slot_entry(&self, slot: SlotId) -> Result<Slot> {
        self.slots
            .iter()
            .find(|s| s.id == slot)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("slot {slot:?} has not been read yet")))
    }

    /// Shared GENERAL AUTHENTICATE round trip for signing: sends
    /// `TLV(0x7C, TLV(0x81, input) || TLV(0x82, empty))` and returns the
    /// signature from the card's `TLV(0x82, signature)`.
    fn general_authenticate_sign(
        &mut self,
        algorithm: AlgorithmId,
        slot: SlotId,
        input: &[u8],
    ) -> Result<Vec<u8>> {
        let mut inner = Vec::new();
        encode_tlv(&mut inner, TAG_GA_CHALLENGE, input);
        encode_tlv(&mut inner, TAG_GA_RESPONSE, &[]);
        let mut body = Vec::new();
        encode_tlv(&mut body, TAG_DYN_AUTH, &inner);

        let cmd = CommandApdu::new(CLA_ISO, INS_GEN_AUTH, algorithm.to_byte(), slot.to_byte(), body)
            .with_le(0x00);
        let resp = self.transceive(cmd, "GENERAL AUTHENTICATE (sign)")?;
        let outer = TlvReader::new(&resp).read_one()?;
        if outer.tag != TAG_DYN_AUTH {
            return Err(Error::invalid_data("sign: missing dynamic auth template"));
        }
        TlvReader::find(&outer.value, TAG_GA_RESPONSE)?
            .ok_or_else(|| Error::invalid_data("sign: card returned no signature"))
    }

    /// Signs `digest` directly, without hashing host-side. Requires `slot`'s
    /// algorithm to be a pre-hash-capable one (anything except the Yubico
    /// hash-on-card extensions 0xF0/0xF1).
    #[instrument(skip(self, digest))]
    pub fn sign_prehash(&mut self, slot: SlotId, hash_alg: HashAlg, digest: &[u8]) -> Result<Vec<u8>> {
        let entry = self.slot_entry(slot)?;
        if entry.algorithm.hashes_on_card() {
            return Err(Error::not_supported(
                "sign_prehash requires a pre-hash-capable algorithm",
            ));
        }
        let input = if entry.algorithm.is_rsa() {
            let key_size = match &entry.public_key {
                SlotPublicKey::Rsa(k) => k.size(),
                _ => return Err(Error::invalid_data("slot algorithm is RSA but key is not")),
            };
            emsa_pkcs1v15(hash_alg, digest, key_size)?
        } else {
            digest.to_vec()
        };
        self.general_authenticate_sign(entry.algorithm, slot, &input)
    }

    /// Signs `payload`, hashing host-side with a digest algorithm chosen to
    /// match the key (curve-matched for ECDSA, SHA-256 by default for RSA)
    /// unless `hash_override` is given. The Yubico PivApplet raw-message
    /// algorithms (0xF0/0xF1) send `payload` unhashed; the card hashes it.
    /// Returns the signature and the hash algorithm actually used, which
    /// the caller must check — it may differ from what was requested.
    #[instrument(skip(self, payload))]
    pub fn sign(
        &mut self,
        slot: SlotId,
        payload: &[u8],
        hash_override: Option<HashAlg>,
    ) -> Result<(Vec<u8>, HashAlg)> {
        let entry = self.slot_entry(slot)?;
        if entry.algorithm.hashes_on_card() {
            let sig = self.general_authenticate_sign(entry.algorithm, slot, payload)?;
            let hash_alg = if entry.algorithm == AlgorithmId::YkEccP256Sha1 {
                HashAlg::Sha1
            } else {
                HashAlg::Sha256
            };
            return Ok((sig, hash_alg));
        }
        let hash_alg = hash_override.unwrap_or(if entry.algorithm == AlgorithmId::EccP384 {
            HashAlg::Sha384
        } else {
            HashAlg::Sha256
        });
        let digest = hash_alg.hash(payload);
        let sig = self.sign_prehash(slot, hash_alg, &digest)?;
        Ok((sig, hash_alg))
    }

    /// Performs ECDH between `slot`'s private key and `peer_point` (an
    /// uncompressed SEC1 EC point), returning the x-coordinate of the
    /// shared point.
    #[instrument(skip(self, peer_point))]
    pub fn ecdh(&mut self, slot: SlotId, peer_point: &[u8]) -> Result<Vec<u8>> {
        let entry = self.slot_entry(slot)?;
        if !entry.algorithm.is_ec() {
            return Err(Error::not_supported("ecdh requires an EC slot"));
        }
        let mut inner = Vec::new();
        encode_tlv(&mut inner, TAG_GA_EXPONENTIATION, peer_point);
        encode_tlv(&mut inner, TAG_GA_RESPONSE, &[]);
        let mut body = Vec::new();
        encode_tlv(&mut body, TAG_DYN_AUTH, &inner);

        let cmd = CommandApdu::new(
            CLA_ISO,
            INS_GEN_AUTH,
            entry.algorithm.to_byte(),
            slot.to_byte(),
            body,
        )
        .with_le(0x00);
        let resp = self.transceive(cmd, "GENERAL AUTHENTICATE (ecdh)")?;
        let outer = TlvReader::new(&resp).read_one()?;
        if outer.tag != TAG_DYN_AUTH {
            return Err(Error::invalid_data("ecdh: missing dynamic auth template"));
        }
        TlvReader::find(&outer.value, TAG_GA_RESPONSE)?
            .ok_or_else(|| Error::invalid_data("ecdh: card returned no shared secret"))
    }

    /// Generates a new asymmetric key pair in `slot`. Requires prior
    /// [`Token::auth_admin`]. YubicoPIV PIN/touch policy is sent only when
    /// this token is Yubico; otherwise the generic PIV `GENERATE` shape is
    /// used.
    #[instrument(skip(self))]
    pub fn generate(
        &mut self,
        slot: SlotId,
        algorithm: AlgorithmId,
        pin_policy: PinPolicy,
        touch_policy: TouchPolicy,
    ) -> Result<SlotPublicKey> {
        if !self.admin_authenticated {
            return Err(Error::permission(
                "generate requires a prior auth_admin in this transaction",
            ));
        }
        let mut control = Vec::new();
        encode_tlv(&mut control, TAG_GEN_ALGORITHM, &[algorithm.to_byte()]);
        if self.is_yubico {
            encode_tlv(&mut control, TAG_GEN_PIN_POLICY, &[pin_policy.to_byte()]);
            encode_tlv(&mut control, TAG_GEN_TOUCH_POLICY, &[touch_policy.to_byte()]);
        }
        let mut body = Vec::new();
        encode_tlv(&mut body, TAG_GEN_CONTROL_TEMPLATE, &control);

        let cmd = CommandApdu::new(CLA_ISO, INS_GEN_ASYM, 0x00, slot.to_byte(), body).with_le(0x00);
        let resp = self.transceive(cmd, "GENERATE ASYMMETRIC")?;
        let wrapper = TlvReader::new(&resp).read_one()?;
        if wrapper.tag != TAG_PUBKEY_WRAPPER {
            return Err(Error::invalid_data("generate: missing public key wrapper"));
        }
        let children = wrapper.children()?;

        let public_key = if algorithm.is_rsa() {
            let modulus = children
                .iter()
                .find(|n| n.tag == TAG_RSA_MODULUS)
                .ok_or_else(|| Error::invalid_data("generate: RSA response missing modulus"))?;
            let exponent = children
                .iter()
                .find(|n| n.tag == TAG_RSA_EXPONENT)
                .ok_or_else(|| Error::invalid_data("generate: RSA response missing exponent"))?;
            let n = rsa::BigUint::from_bytes_be(&modulus.value);
            let e = rsa::BigUint::from_bytes_be(&exponent.value);
            let key = rsa::RsaPublicKey::new(n, e)
                .map_err(|e| Error::invalid_data(format!("generate: invalid RSA key: {e}")))?;
            SlotPublicKey::Rsa(key)
        } else if algorithm.is_ec() {
            let point = children
                .iter()
                .find(|n| n.tag == TAG_EC_POINT)
                .ok_or_else(|| Error::invalid_data("generate: EC response missing point"))?;
            match algorithm {
                AlgorithmId::EccP256 => {
                    let pk = p256::PublicKey::from_sec1_bytes(&point.value)
                        .map_err(|e| Error::invalid_data(format!("generate: invalid EC point: {e}")))?;
                    SlotPublicKey::EcP256(pk)
                }
                AlgorithmId::EccP384 => SlotPublicKey::EcP384(point.value.clone()),
                other => return Err(Error::not_supported(format!("cannot generate {other:?}"))),
            }
        } else {
            return Err(Error::not_supported(format!("cannot generate {algorithm:?}")));
        };

        tracing::info!(?slot, ?algorithm, "key generated");
        Ok(public_key)
    }

    /// YubicoPIV: imports caller-supplied private key material into `slot`
    /// (INS 0xFE), replacing whatever key was there. Requires prior
    /// [`Token::auth_admin`], same as [`Token::generate`]. Unlike generate,
    /// the card returns no public key, so the caller is expected to already
    /// hold (and separately load via [`Token::write_cert`]) the matching
    /// certificate. The key material is chained across multiple APDUs when
    /// it exceeds 255 bytes (always true for RSA) and the input buffers are
    /// zeroized on every exit path.
    #[instrument(skip(self, key))]
    pub fn import_key(
        &mut self,
        slot: SlotId,
        algorithm: AlgorithmId,
        key: PrivateKeyMaterial,
        pin_policy: PinPolicy,
        touch_policy: TouchPolicy,
    ) -> Result<()> {
        if !self.admin_authenticated {
            return Err(Error::permission(
                "import_key requires a prior auth_admin in this transaction",
            ));
        }
        if slot == SlotId::CardManagement || slot == SlotId::Attestation {
            return Err(Error::not_supported(format!(
                "{slot:?} cannot hold an imported key"
            )));
        }

        let mut body = Zeroizing::new(Vec::new());
        match (&key, algorithm.is_rsa(), algorithm.is_ec()) {
            (PrivateKeyMaterial::Rsa { p, q, dp, dq, qinv }, true, _) => {
                encode_tlv(&mut body, TAG_IMPORT_RSA_P, p);
                encode_tlv(&mut body, TAG_IMPORT_RSA_Q, q);
                encode_tlv(&mut body, TAG_IMPORT_RSA_DP, dp);
                encode_tlv(&mut body, TAG_IMPORT_RSA_DQ, dq);
                encode_tlv(&mut body, TAG_IMPORT_RSA_QINV, qinv);
            }
            (PrivateKeyMaterial::Ec(scalar), _, true) => {
                encode_tlv(&mut body, TAG_IMPORT_EC_PRIVATE, scalar);
            }
            _ => {
                return Err(Error::invalid_data(
                    "import_key: key material does not match the requested algorithm",
                ))
            }
        }
        if self.is_yubico {
            encode_tlv(&mut body, TAG_GEN_PIN_POLICY, &[pin_policy.to_byte()]);
            encode_tlv(&mut body, TAG_GEN_TOUCH_POLICY, &[touch_policy.to_byte()]);
        }

        self.transceive_chain(
            INS_IMPORT_ASYM,
            algorithm.to_byte(),
            slot.to_byte(),
            &body,
            "IMPORT ASYMMETRIC KEY",
        )?;
        tracing::info!(?slot, ?algorithm, "key imported");
        Ok(())
    }

    /// Loads a certificate into `slot`'s container (requires prior
    /// `auth_admin`), wrapping it in the same `70`/`71`/`FE` envelope
    /// `read_cert` parses. `compressed` marks the certificate as
    /// gzip-compressed (tag `0x71` value `1`) instead of storing it raw.
    #[instrument(skip(self, der))]
    pub fn write_cert(&mut self, slot: SlotId, der: &[u8], compressed: bool) -> Result<()> {
        if !self.admin_authenticated {
            return Err(Error::permission(
                "write_cert requires a prior auth_admin in this transaction",
            ));
        }
        let tag = slot.cert_tag();
        if tag == 0 {
            return Err(Error::not_supported(
                "slot 9B (card management) has no certificate container",
            ));
        }
        let mut value = Vec::new();
        encode_tlv(&mut value, 0x70, der);
        encode_tlv(&mut value, 0x71, &[if compressed { 1 } else { 0 }]);
        encode_tlv(&mut value, 0xFE, &[]);

        let tag_bytes = tag.to_be_bytes();
        self.put_data(&tag_bytes[1..], &value)?;
        tracing::info!(?slot, "certificate written");
        Ok(())
    }

    /// Proof-of-possession: signs a fresh random 32-byte challenge with
    /// `slot` and verifies the signature against `expected`. On success the
    /// caller can trust `expected` is indeed the public half of the key in
    /// `slot`.
    #[instrument(skip(self, expected))]
    pub fn auth_key(&mut self, slot: SlotId, expected: &SlotPublicKey) -> Result<()> {
        let mut challenge = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut challenge);
        let (sig, hash_alg) = self.sign(slot, &challenge, None)?;
        let digest = hash_alg.hash(&challenge);

        let ok = match expected {
            SlotPublicKey::EcP256(pk) => verify_p256(pk, &digest, &sig),
            SlotPublicKey::Rsa(pk) => verify_rsa(pk, hash_alg, &digest, &sig),
            SlotPublicKey::EcP384(_) => {
                return Err(Error::not_supported(
                    "auth_key verification is not implemented for P-384",
                ))
            }
        };
        if ok {
            Ok(())
        } else {
            Err(Error::NotMatch)
        }
    }

    /// YubicoPIV: fetches the attestation certificate for a key generated
    /// in `slot`, as raw X.509 DER. The caller verifies it against the
    /// Yubico attestation CA out of band.
    #[instrument(skip(self))]
    pub fn attest(&mut self, slot: SlotId) -> Result<Vec<u8>> {
        let cmd = CommandApdu::new(CLA_ISO, INS_ATTEST, 0x00, slot.to_byte(), Vec::new()).with_le(0x00);
        self.transceive(cmd, "ATTEST")
    }
}

// `digest` here is already the hash value the card's signature was taken
// over (the card signs the digest directly, or for RSA the EMSA-PKCS1-v1.5
// block built from it, never the raw challenge bytes) — the plain
// `Verifier` trait would hash it again before comparing, which can never
// match. These go through `PrehashVerifier` instead, which compares against
// `digest` as given.

fn verify_p256(pk: &p256::PublicKey, digest: &[u8], sig: &[u8]) -> bool {
    use p256::ecdsa::signature::hazmat::PrehashVerifier;
    use p256::ecdsa::{Signature, VerifyingKey};

    let verifying_key = VerifyingKey::from(pk);
    let signature = match Signature::from_der(sig) {
        Ok(s) => s,
        Err(_) => return false,
    };
    verifying_key.verify_prehash(digest, &signature).is_ok()
}

fn verify_rsa(pk: &rsa::RsaPublicKey, hash_alg: HashAlg, digest: &[u8], sig: &[u8]) -> bool {
    use rsa::pkcs1v15::{Signature, VerifyingKey};
    use rsa::signature::hazmat::PrehashVerifier;

    let signature = match Signature::try_from(sig) {
        Ok(s) => s,
        Err(_) => return false,
    };
    match hash_alg {
        HashAlg::Sha1 => VerifyingKey::<Sha1>::new(pk.clone())
            .verify_prehash(digest, &signature)
            .is_ok(),
        HashAlg::Sha256 => VerifyingKey::<Sha256>::new(pk.clone())
            .verify_prehash(digest, &signature)
            .is_ok(),
        HashAlg::Sha384 => VerifyingKey::<Sha384>::new(pk.clone())
            .verify_prehash(digest, &signature)
            .is_ok(),
        HashAlg::Sha512 => VerifyingKey::<Sha512>::new(pk.clone())
            .verify_prehash(digest, &signature)
            .is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::mock::MockCard;
    use crate::transport::{CardProtocol, ReaderBackend, ShareMode};

    fn token_with_slot(
        card: MockCard,
        slot: SlotId,
        algorithm: AlgorithmId,
        public_key: SlotPublicKey,
    ) -> Token<crate::transport::mock::MockConnection> {
        let backend = card.into_backend();
        let conn = backend
            .connect("Mock", ShareMode::Shared, &[CardProtocol::T1])
            .unwrap();
        let mut token = Token::new(conn, ClientConfig::default(), "Mock".to_string());
        token.slots.push(Slot {
            id: slot,
            algorithm,
            certificate_der: Vec::new(),
            subject: String::new(),
            public_key,
        });
        token
    }

    #[test]
    fn emsa_pkcs1v15_has_correct_layout() {
        let digest = [0xABu8; 32];
        let em = emsa_pkcs1v15(HashAlg::Sha256, &digest, 256).unwrap();
        assert_eq!(em.len(), 256);
        assert_eq!(em[0], 0x00);
        assert_eq!(em[1], 0x01);
        assert_eq!(em[em.len() - 32..], digest);
        // padding is all 0xFF up to the 0x00 separator before DigestInfo
        let digest_info_start = 256 - 19 - 32;
        assert!(em[2..digest_info_start - 1].iter().all(|&b| b == 0xFF));
        assert_eq!(em[digest_info_start - 1], 0x00);
    }

    #[test]
    fn key_too_small_for_hash_is_rejected() {
        let digest = [0u8; 64]; // SHA-512
        let err = emsa_pkcs1v15(HashAlg::Sha512, &digest, 32).unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }

    #[test]
    fn ecdh_rejects_non_ec_slot() {
        let card = MockCard::new();
        let mut token = token_with_slot(
            card,
            SlotId::Authentication,
            AlgorithmId::Rsa2048,
            SlotPublicKey::Rsa(
                rsa::RsaPublicKey::new(rsa::BigUint::from(65537u32), rsa::BigUint::from(65537u32))
                    .unwrap_or_else(|_| {
                        // construct a trivially valid (if useless) key for the test
                        rsa::RsaPublicKey::new(rsa::BigUint::from(15u32), rsa::BigUint::from(3u32))
                            .unwrap()
                    }),
            ),
        );
        let err = token.ecdh(SlotId::Authentication, &[0u8; 65]).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn generate_requires_prior_admin_auth() {
        let card = MockCard::new();
        let backend = card.into_backend();
        let conn = backend
            .connect("Mock", ShareMode::Shared, &[CardProtocol::T1])
            .unwrap();
        let mut token = Token::new(conn, ClientConfig::default(), "Mock".to_string());
        let err = token
            .generate(
                SlotId::Authentication,
                AlgorithmId::EccP256,
                PinPolicy::default(),
                TouchPolicy::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
    }

    #[test]
    fn import_key_requires_prior_admin_auth() {
        let card = MockCard::new();
        let backend = card.into_backend();
        let conn = backend
            .connect("Mock", ShareMode::Shared, &[CardProtocol::T1])
            .unwrap();
        let mut token = Token::new(conn, ClientConfig::default(), "Mock".to_string());
        let err = token
            .import_key(
                SlotId::Authentication,
                AlgorithmId::EccP256,
                PrivateKeyMaterial::Ec(Zeroizing::new(vec![0x11; 32])),
                PinPolicy::default(),
                TouchPolicy::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
    }

    #[test]
    fn import_key_rejects_card_management_slot() {
        let card = MockCard::new();
        let backend = card.into_backend();
        let conn = backend
            .connect("Mock", ShareMode::Shared, &[CardProtocol::T1])
            .unwrap();
        let mut token = Token::new(conn, ClientConfig::default(), "Mock".to_string());
        token.admin_authenticated = true;
        let err = token
            .import_key(
                SlotId::CardManagement,
                AlgorithmId::EccP256,
                PrivateKeyMaterial::Ec(Zeroizing::new(vec![0x11; 32])),
                PinPolicy::default(),
                TouchPolicy::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn import_key_sends_ec_scalar_and_succeeds() {
        let card = MockCard::new();
        card.push_response(0x00, 0xFE, AlgorithmId::EccP256.to_byte(), 0x9A, vec![0x90, 0x00]);
        let backend = card.into_backend();
        let conn = backend
            .connect("Mock", ShareMode::Shared, &[CardProtocol::T1])
            .unwrap();
        let mut token = Token::new(conn, ClientConfig::default(), "Mock".to_string());
        token.admin_authenticated = true;
        token
            .import_key(
                SlotId::Authentication,
                AlgorithmId::EccP256,
                PrivateKeyMaterial::Ec(Zeroizing::new(vec![0x22; 32])),
                PinPolicy::default(),
                TouchPolicy::default(),
            )
            .unwrap();
    }

    // Exercises the §8 invariant "a sign then verify with the slot's public
    // key over any 32-byte input returns valid": `auth_key` signs a fresh
    // challenge via `sign`, then verifies the card's signature against the
    // caller-supplied public key. The mock card signs with a real P-256
    // key over whatever digest the host sent, the same way `verify_p256`
    // has to check it — this is what would have caught the double-hash bug
    // where `Verifier::verify` hashed an already-hashed digest a second
    // time and every proof of possession failed.
    #[test]
    fn auth_key_round_trip_succeeds_for_a_matching_p256_key() {
        use p256::ecdsa::signature::hazmat::PrehashSigner;
        use p256::ecdsa::{Signature as EcdsaSignature, SigningKey};

        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let public = secret.public_key();
        let signing_key = SigningKey::from(&secret);

        let card = MockCard::new();
        card.push_responder(
            0x00,
            0x87,
            AlgorithmId::EccP256.to_byte(),
            SlotId::Authentication.to_byte(),
            move |raw_cmd| {
                let lc = raw_cmd[4] as usize;
                let body = &raw_cmd[5..5 + lc];
                let outer = TlvReader::new(body).read_one().unwrap();
                let digest = TlvReader::find(&outer.value, TAG_GA_CHALLENGE)
                    .unwrap()
                    .unwrap();
                let sig: EcdsaSignature = signing_key.sign_prehash(&digest).unwrap();
                let der = sig.to_der();
                let mut resp = Vec::new();
                let mut inner = Vec::new();
                encode_tlv(&mut inner, TAG_GA_RESPONSE, der.as_bytes());
                encode_tlv(&mut resp, TAG_DYN_AUTH, &inner);
                resp.extend_from_slice(&[0x90, 0x00]);
                resp
            },
        );

        let mut token = token_with_slot(
            card,
            SlotId::Authentication,
            AlgorithmId::EccP256,
            SlotPublicKey::EcP256(public.clone()),
        );

        token
            .auth_key(SlotId::Authentication, &SlotPublicKey::EcP256(public))
            .unwrap();
    }

    #[test]
    fn auth_key_fails_against_a_non_matching_key() {
        use p256::ecdsa::signature::hazmat::PrehashSigner;
        use p256::ecdsa::{Signature as EcdsaSignature, SigningKey};

        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let signing_key = SigningKey::from(&secret);
        let wrong_public = p256::SecretKey::random(&mut rand::rngs::OsRng).public_key();

        let card = MockCard::new();
        card.push_responder(
            0x00,
            0x87,
            AlgorithmId::EccP256.to_byte(),
            SlotId::Authentication.to_byte(),
            move |raw_cmd| {
                let lc = raw_cmd[4] as usize;
                let body = &raw_cmd[5..5 + lc];
                let outer = TlvReader::new(body).read_one().unwrap();
                let digest = TlvReader::find(&outer.value, TAG_GA_CHALLENGE)
                    .unwrap()
                    .unwrap();
                let sig: EcdsaSignature = signing_key.sign_prehash(&digest).unwrap();
                let der = sig.to_der();
                let mut resp = Vec::new();
                let mut inner = Vec::new();
                encode_tlv(&mut inner, TAG_GA_RESPONSE, der.as_bytes());
                encode_tlv(&mut resp, TAG_DYN_AUTH, &inner);
                resp.extend_from_slice(&[0x90, 0x00]);
                resp
            },
        );

        let mut token = token_with_slot(
            card,
            SlotId::Authentication,
            AlgorithmId::EccP256,
            SlotPublicKey::EcP256(wrong_public.clone()),
        );

        let err = token
            .auth_key(SlotId::Authentication, &SlotPublicKey::EcP256(wrong_public))
            .unwrap_err();
        assert!(matches!(err, Error::NotMatch));
    }
}
