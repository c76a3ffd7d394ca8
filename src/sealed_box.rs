//! ECDH sealed-box envelope: wraps a payload to a PIV key management slot
//! the way an SSH-agent-friendly `piv_ecdh_box` does, but as direct
//! seal/open functions rather than a mutable-field struct. Grounded in
//! `piv.h`'s `struct piv_ecdh_box` fields and the `piv_box_seal`/
//! `piv_box_seal_offline`/`piv_box_open`/`piv_box_to_binary` doc comments.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use tracing::instrument;
use zeroize::Zeroizing;

use crate::config::{SealedBoxCipher, SealedBoxKdf};
use crate::constants::SlotId;
use crate::error::{Error, Result};
use crate::slot::SlotPublicKey;
use crate::tlv::{encode_tlv, TlvReader};
use crate::token::Token;
use crate::transport::CardConnection;

const MAGIC: &[u8; 4] = b"PVBX";
const FORMAT_VERSION: u8 = 1;

const TAG_GUID: u32 = 0x01;
const TAG_SLOT: u32 = 0x02;
const TAG_EPHEMERAL_PUB: u32 = 0x03;
const TAG_RECIPIENT_PUB: u32 = 0x04;
const TAG_CIPHER: u32 = 0x05;
const TAG_KDF: u32 = 0x06;
const TAG_IV: u32 = 0x07;
const TAG_CIPHERTEXT: u32 = 0x08;

const CIPHER_CHACHA20POLY1305: u8 = 1;
const CIPHER_AES256GCM: u8 = 2;
const KDF_HKDF_SHA256: u8 = 1;

/// A sealed payload addressed to one PIV key management slot on one card.
/// Unlike the C `piv_ecdh_box`, the plaintext is never a field of this
/// struct: `seal`/`seal_offline` take it as an argument and `open`/
/// `open_offline` return it, so there is no "plaintext present XOR
/// ciphertext present" state to get wrong.
#[derive(Debug, Clone)]
pub struct SealedBox {
    /// GUID of the token this box targets, if known (absent for boxes sealed
    /// fully offline against a bare public key).
    pub guid: Option<[u8; 16]>,
    pub slot: Option<SlotId>,
    /// Ephemeral public key generated for this seal.
    pub ephemeral_pub: Vec<u8>,
    /// Recipient's (the slot's) public key, uncompressed SEC1 point.
    pub recipient_pub: Vec<u8>,
    pub cipher: SealedBoxCipher,
    pub kdf: SealedBoxKdf,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl SealedBox {
    /// Serializes this box to its self-describing binary wire format:
    /// `"PVBX"` magic, a version byte, then its fields as TLVs.
    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        if let Some(guid) = self.guid {
            encode_tlv(&mut out, TAG_GUID, &guid);
        }
        if let Some(slot) = self.slot {
            encode_tlv(&mut out, TAG_SLOT, &[slot.to_byte()]);
        }
        encode_tlv(&mut out, TAG_EPHEMERAL_PUB, &self.ephemeral_pub);
        encode_tlv(&mut out, TAG_RECIPIENT_PUB, &self.recipient_pub);
        encode_tlv(&mut out, TAG_CIPHER, &[cipher_byte(self.cipher)]);
        encode_tlv(&mut out, TAG_KDF, &[kdf_byte(self.kdf)]);
        encode_tlv(&mut out, TAG_IV, &self.iv);
        encode_tlv(&mut out, TAG_CIPHERTEXT, &self.ciphertext);
        out
    }

    /// Parses a box from [`SealedBox::to_binary`]'s wire format.
    pub fn from_binary(input: &[u8]) -> Result<Self> {
        if input.len() < 5 || &input[0..4] != MAGIC {
            return Err(Error::invalid_data("sealed box: bad magic"));
        }
        if input[4] != FORMAT_VERSION {
            return Err(Error::invalid_data(format!(
                "sealed box: unsupported format version {}",
                input[4]
            )));
        }
        let nodes = TlvReader::new(&input[5..]).read_all()?;

        let mut guid = None;
        let mut slot = None;
        let mut ephemeral_pub = None;
        let mut recipient_pub = None;
        let mut cipher = None;
        let mut kdf = None;
        let mut iv = None;
        let mut ciphertext = None;

        for node in nodes {
            match node.tag {
                TAG_GUID => {
                    if node.value.len() != 16 {
                        return Err(Error::invalid_data("sealed box: GUID must be 16 bytes"));
                    }
                    let mut g = [0u8; 16];
                    g.copy_from_slice(&node.value);
                    guid = Some(g);
                }
                TAG_SLOT => {
                    let b = *node
                        .value
                        .first()
                        .ok_or_else(|| Error::invalid_data("sealed box: empty slot field"))?;
                    slot = Some(SlotId::from_byte(b).ok_or_else(|| {
                        Error::invalid_data(format!("sealed box: unknown slot byte {b:02X}"))
                    })?);
                }
                TAG_EPHEMERAL_PUB => ephemeral_pub = Some(node.value),
                TAG_RECIPIENT_PUB => recipient_pub = Some(node.value),
                TAG_CIPHER => cipher = Some(cipher_from_byte(node.value.first().copied())?),
                TAG_KDF => kdf = Some(kdf_from_byte(node.value.first().copied())?),
                TAG_IV => iv = Some(node.value),
                TAG_CIPHERTEXT => ciphertext = Some(node.value),
                _ => {}
            }
        }

        Ok(SealedBox {
            guid,
            slot,
            ephemeral_pub: ephemeral_pub
                .ok_or_else(|| Error::invalid_data("sealed box: missing ephemeral public key"))?,
            recipient_pub: recipient_pub
                .ok_or_else(|| Error::invalid_data("sealed box: missing recipient public key"))?,
            cipher: cipher.ok_or_else(|| Error::invalid_data("sealed box: missing cipher field"))?,
            kdf: kdf.ok_or_else(|| Error::invalid_data("sealed box: missing KDF field"))?,
            iv: iv.ok_or_else(|| Error::invalid_data("sealed box: missing IV"))?,
            ciphertext: ciphertext
                .ok_or_else(|| Error::invalid_data("sealed box: missing ciphertext"))?,
        })
    }
}

fn cipher_byte(c: SealedBoxCipher) -> u8 {
    match c {
        SealedBoxCipher::ChaCha20Poly1305 => CIPHER_CHACHA20POLY1305,
        SealedBoxCipher::Aes256Gcm => CIPHER_AES256GCM,
    }
}

fn cipher_from_byte(b: Option<u8>) -> Result<SealedBoxCipher> {
    match b {
        Some(CIPHER_CHACHA20POLY1305) => Ok(SealedBoxCipher::ChaCha20Poly1305),
        Some(CIPHER_AES256GCM) => Ok(SealedBoxCipher::Aes256Gcm),
        other => Err(Error::invalid_data(format!(
            "sealed box: unknown cipher id {other:?}"
        ))),
    }
}

fn kdf_byte(k: SealedBoxKdf) -> u8 {
    match k {
        SealedBoxKdf::HkdfSha256 => KDF_HKDF_SHA256,
    }
}

fn kdf_from_byte(b: Option<u8>) -> Result<SealedBoxKdf> {
    match b {
        Some(KDF_HKDF_SHA256) => Ok(SealedBoxKdf::HkdfSha256),
        other => Err(Error::invalid_data(format!(
            "sealed box: unknown KDF id {other:?}"
        ))),
    }
}

/// Derives the AEAD wrap key from an ECDH shared secret: HKDF-SHA256 with
/// no salt, info string `"piv-session sealed box"`, 32 output bytes.
fn derive_wrap_key(shared_secret: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(b"piv-session sealed box", &mut *okm)
        .map_err(|_| Error::invalid_data("HKDF expand failed"))?;
    Ok(okm)
}

fn aead_seal(
    cipher: SealedBoxCipher,
    wrap_key: &[u8; 32],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut iv = vec![0u8; 12];
    rand::thread_rng().fill_bytes(&mut iv);
    let payload = Payload { msg: plaintext, aad };
    let ciphertext = match cipher {
        SealedBoxCipher::ChaCha20Poly1305 => {
            let c = ChaCha20Poly1305::new_from_slice(wrap_key)
                .map_err(|_| Error::invalid_data("invalid sealed box key length"))?;
            c.encrypt(chacha20poly1305::Nonce::from_slice(&iv), payload)
                .map_err(|_| Error::invalid_data("sealed box encryption failed"))?
        }
        SealedBoxCipher::Aes256Gcm => {
            let c = Aes256Gcm::new_from_slice(wrap_key)
                .map_err(|_| Error::invalid_data("invalid sealed box key length"))?;
            c.encrypt(aes_gcm::Nonce::from_slice(&iv), payload)
                .map_err(|_| Error::invalid_data("sealed box encryption failed"))?
        }
    };
    Ok((iv, ciphertext))
}

fn aead_open(
    cipher: SealedBoxCipher,
    wrap_key: &[u8; 32],
    iv: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let payload = Payload { msg: ciphertext, aad };
    let plaintext = match cipher {
        SealedBoxCipher::ChaCha20Poly1305 => {
            let c = ChaCha20Poly1305::new_from_slice(wrap_key)
                .map_err(|_| Error::invalid_data("invalid sealed box key length"))?;
            c.decrypt(chacha20poly1305::Nonce::from_slice(iv), payload)
                .map_err(|_| Error::Integrity)?
        }
        SealedBoxCipher::Aes256Gcm => {
            let c = Aes256Gcm::new_from_slice(wrap_key)
                .map_err(|_| Error::invalid_data("invalid sealed box key length"))?;
            c.decrypt(aes_gcm::Nonce::from_slice(iv), payload)
                .map_err(|_| Error::Integrity)?
        }
    };
    Ok(Zeroizing::new(plaintext))
}

/// Seals `plaintext` to `recipient`'s P-256 public key without touching a
/// card: generates an ephemeral P-256 keypair, runs host-side ECDH, and
/// AEAD-wraps the plaintext under a key HKDF-derived from the shared
/// secret. Used for "offline" sealing, e.g. by a peer that has a PIV
/// slot's certificate but no card of its own.
#[instrument(skip(plaintext, recipient))]
pub fn seal_offline(
    recipient: &SlotPublicKey,
    plaintext: &[u8],
    cipher: SealedBoxCipher,
) -> Result<SealedBox> {
    let recipient_pk = match recipient {
        SlotPublicKey::EcP256(pk) => pk,
        _ => {
            return Err(Error::not_supported(
                "offline sealing is only implemented for P-256 recipients",
            ))
        }
    };

    let ephemeral = p256::ecdh::EphemeralSecret::random(&mut rand::rngs::OsRng);
    let ephemeral_pub = p256::PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient_pk);
    let wrap_key = derive_wrap_key(shared.raw_secret_bytes().as_slice())?;

    let recipient_bytes = recipient_pk.to_sec1_bytes().to_vec();
    let (iv, ciphertext) = aead_seal(cipher, &wrap_key, plaintext, &recipient_bytes)?;

    Ok(SealedBox {
        guid: None,
        slot: None,
        ephemeral_pub: ephemeral_pub.to_sec1_bytes().to_vec(),
        recipient_pub: recipient_bytes,
        cipher,
        kdf: SealedBoxKdf::HkdfSha256,
        iv,
        ciphertext,
    })
}

/// Opens a box sealed with [`seal_offline`] using the recipient's raw P-256
/// private scalar. Only the holder of that private key (normally only the
/// card itself) can do this; host-side use is for testing and for keys
/// deliberately exported off the card.
#[instrument(skip(plaintext_key, box_))]
pub fn open_offline(plaintext_key: &p256::SecretKey, box_: &SealedBox) -> Result<Zeroizing<Vec<u8>>> {
    let ephemeral_pub = p256::PublicKey::from_sec1_bytes(&box_.ephemeral_pub)
        .map_err(|e| Error::invalid_data(format!("sealed box: bad ephemeral point: {e}")))?;
    let shared = p256::ecdh::diffie_hellman(
        plaintext_key.to_nonzero_scalar(),
        ephemeral_pub.as_affine(),
    );
    let wrap_key = derive_wrap_key(shared.raw_secret_bytes().as_slice())?;
    aead_open(
        box_.cipher,
        &wrap_key,
        &box_.iv,
        &box_.ciphertext,
        &box_.recipient_pub,
    )
}

impl<C: CardConnection> Token<C> {
    /// Seals `plaintext` to `slot` on this card: generates an ephemeral
    /// P-256 keypair host-side, records this token's GUID and the target
    /// slot in the box so [`find_token`] can later route an `open` call
    /// back to the right card, but performs the ECDH itself rather than
    /// asking the card (the card's private key never has to move, but
    /// sealing doesn't require a transaction either).
    #[instrument(skip(self, plaintext))]
    pub fn seal(&mut self, slot: SlotId, plaintext: &[u8]) -> Result<SealedBox> {
        let entry = self
            .slots
            .iter()
            .find(|s| s.id == slot)
            .ok_or_else(|| Error::not_found(format!("slot {slot:?} has not been read yet")))?;
        let mut sealed = seal_offline(&entry.public_key, plaintext, self.config.default_cipher)?;
        sealed.guid = Some(self.guid);
        sealed.slot = Some(slot);
        Ok(sealed)
    }

    /// Opens `box_`, which must target a slot on this token, by performing
    /// ECDH on-card (the slot's private key never leaves the card) and
    /// deriving/unwrapping the payload host-side from the resulting shared
    /// secret.
    #[instrument(skip(self, box_))]
    pub fn open(&mut self, box_: &SealedBox) -> Result<Zeroizing<Vec<u8>>> {
        if let Some(guid) = box_.guid {
            if guid != self.guid {
                return Err(Error::not_found("sealed box targets a different token"));
            }
        }
        let slot = box_
            .slot
            .ok_or_else(|| Error::invalid_data("sealed box has no target slot"))?;
        let shared_x = self.ecdh(slot, &box_.ephemeral_pub)?;
        let wrap_key = derive_wrap_key(&shared_x)?;
        aead_open(
            box_.cipher,
            &wrap_key,
            &box_.iv,
            &box_.ciphertext,
            &box_.recipient_pub,
        )
    }
}

/// Finds which of `tokens` a box targets. If the box carries a GUID, matches
/// on that directly. Otherwise falls back to scanning every token's read
/// slots and comparing public keys for equality against the box's recorded
/// recipient key, the way a box sealed fully offline (no card, no GUID) has
/// to be routed back to a card after the fact.
pub fn find_token<'a, C: CardConnection>(tokens: &'a [Token<C>], box_: &SealedBox) -> Option<&'a Token<C>> {
    if let Some(guid) = box_.guid {
        return tokens.iter().find(|t| t.guid() == guid);
    }
    tokens.iter().find(|t| {
        t.slots()
            .iter()
            .any(|s| slot_public_key_bytes(&s.public_key) == box_.recipient_pub)
    })
}

/// The raw public-key bytes this module compares sealed-box recipient keys
/// against: the uncompressed SEC1 point for EC keys. RSA slots never hold
/// an ECDH-capable key, so they can't match a sealed box's recipient field.
fn slot_public_key_bytes(pk: &SlotPublicKey) -> Vec<u8> {
    match pk {
        SlotPublicKey::EcP256(k) => k.to_sec1_bytes().to_vec(),
        SlotPublicKey::EcP384(bytes) => bytes.clone(),
        SlotPublicKey::Rsa(_) => Vec::new(),
    }
}
