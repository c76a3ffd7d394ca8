//! `Slot`: one asymmetric key container (9A/9B/9C/9D/9E, retired 82–95,
//! attestation F9) and the GET DATA container parser that fills it in.
//! Grounded in `piv.h`'s `struct piv_slot` and the `piv_read_cert` doc
//! comment describing the `53`/`70`/`71`/`72`/`FE` container layout.

use std::io::Read;

use flate2::read::GzDecoder;
use tracing::instrument;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey as Spki;

use crate::constants::{AlgorithmId, SlotId, TAG_CONTAINER};
use crate::error::{Error, Result};
use crate::tlv::TlvReader;
use crate::transport::CardConnection;

/// The public key extracted from a slot's certificate. Only P-256 is
/// modeled concretely for on-host use (proof-of-possession, sealed boxes);
/// P-384 and RSA keys are carried as recognized-but-opaque-to-crypto data
/// so certificate *reading* still succeeds for those slots.
#[derive(Debug, Clone)]
pub enum SlotPublicKey {
    EcP256(p256::PublicKey),
    /// Uncompressed SEC1 point for a P-384 key. No P-384 arithmetic is
    /// implemented in this crate (see DESIGN.md); this variant exists so
    /// `read_cert` doesn't have to reject a card that legitimately has one.
    EcP384(Vec<u8>),
    Rsa(rsa::RsaPublicKey),
}

/// One slot's certificate and derived key material.
#[derive(Debug, Clone)]
pub struct Slot {
    pub id: SlotId,
    pub algorithm: AlgorithmId,
    pub certificate_der: Vec<u8>,
    pub subject: String,
    pub public_key: SlotPublicKey,
}

fn algorithm_and_key_from_der(der: &[u8]) -> Result<(AlgorithmId, SlotPublicKey)> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::invalid_data(format!("certificate parse failed: {e}")))?;
    let spki = cert.public_key();
    let oid = spki.algorithm.algorithm.to_id_string();

    match oid.as_str() {
        // rsaEncryption
        "1.2.840.113549.1.1.1" => {
            let rsa_pk = match spki.parsed() {
                Ok(Spki::RSA(rsa_pk)) => rsa_pk,
                _ => return Err(Error::invalid_data("RSA SPKI did not parse as RSA")),
            };
            let n = rsa::BigUint::from_bytes_be(rsa_pk.modulus);
            let e = rsa::BigUint::from_bytes_be(rsa_pk.exponent);
            let key = rsa::RsaPublicKey::new(n, e)
                .map_err(|e| Error::invalid_data(format!("invalid RSA public key: {e}")))?;
            let alg = if rsa_pk.modulus.len() <= 129 {
                AlgorithmId::Rsa1024
            } else {
                AlgorithmId::Rsa2048
            };
            Ok((alg, SlotPublicKey::Rsa(key)))
        }
        // id-ecPublicKey
        "1.2.840.10045.2.1" => {
            let params_oid = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.as_oid().ok())
                .map(|o| o.to_id_string())
                .unwrap_or_default();
            let point = spki.subject_public_key.data.as_ref();
            match params_oid.as_str() {
                // prime256v1 / secp256r1
                "1.2.840.10045.3.1.7" => {
                    let pk = p256::PublicKey::from_sec1_bytes(point)
                        .map_err(|e| Error::invalid_data(format!("invalid EC point: {e}")))?;
                    Ok((AlgorithmId::EccP256, SlotPublicKey::EcP256(pk)))
                }
                // secp384r1
                "1.3.132.0.34" => Ok((AlgorithmId::EccP384, SlotPublicKey::EcP384(point.to_vec()))),
                other => Err(Error::not_supported(format!(
                    "unrecognized EC curve OID {other}"
                ))),
            }
        }
        other => Err(Error::not_supported(format!(
            "unrecognized public key algorithm OID {other}"
        ))),
    }
}

impl<C: CardConnection> crate::token::Token<C> {
    /// Reads and parses the certificate container for `slot`, inserting or
    /// replacing its entry in `self.slots`.
    #[instrument(skip(self))]
    pub fn read_cert(&mut self, slot: SlotId) -> Result<Slot> {
        let tag = slot.cert_tag();
        if tag == 0 {
            return Err(Error::not_supported(
                "slot 9B (card management) has no certificate container",
            ));
        }

        let body = self.get_data(&tag.to_be_bytes_trimmed())?;

        let container = TlvReader::find(&body, TAG_CONTAINER)?
            .ok_or_else(|| Error::not_found(format!("no container object for slot {:?}", slot)))?;
        let children = TlvReader::new(&container).read_all()?;

        let mut cert_der: Option<Vec<u8>> = None;
        let mut compression = 0u8;
        for node in &children {
            match node.tag {
                0x70 => cert_der = Some(node.value.clone()),
                0x71 => compression = node.value.first().copied().unwrap_or(0),
                0x72 | 0xFE => {} // LRC / integrity: accepted whether present or absent
                _ => {}
            }
        }
        let mut der = cert_der.ok_or_else(|| Error::not_found("container has no certificate"))?;

        if compression == 1 {
            let mut decoder = GzDecoder::new(der.as_slice());
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| Error::invalid_data(format!("gzip decompression failed: {e}")))?;
            der = decompressed;
        }

        let (algorithm, public_key) = algorithm_and_key_from_der(&der)?;
        let (_, parsed) = X509Certificate::from_der(&der)
            .map_err(|e| Error::invalid_data(format!("certificate parse failed: {e}")))?;
        let subject = parsed.subject().to_string();

        let slot_entry = Slot {
            id: slot,
            algorithm,
            certificate_der: der,
            subject,
            public_key,
        };

        if let Some(existing) = self.slots.iter_mut().find(|s| s.id == slot) {
            *existing = slot_entry.clone();
        } else {
            self.slots.push(slot_entry.clone());
        }
        Ok(slot_entry)
    }

    /// Reads every standard + retired + attestation slot, swallowing
    /// `not-found`/`not-supported` (empty or unsupported slots) and
    /// returning any other error immediately.
    pub fn read_all_certs(&mut self) -> Result<()> {
        for slot in SlotId::all_key_slots() {
            match self.read_cert(slot) {
                Ok(_) => {}
                Err(Error::NotFound(_)) | Err(Error::NotSupported(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// The slots discovered so far (via `read_cert`/`read_all_certs`).
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }
}

trait TrimmedBeBytes {
    fn to_be_bytes_trimmed(self) -> Vec<u8>;
}

impl TrimmedBeBytes for u32 {
    fn to_be_bytes_trimmed(self) -> Vec<u8> {
        let bytes = self.to_be_bytes();
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(3);
        bytes[start..].to_vec()
    }
}
