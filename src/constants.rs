//! PIV wire constants: the application identifier, instruction codes, data
//! object tags, algorithm and slot identifiers, and the status-word family
//! boundaries. Values are taken from NIST SP 800-73 and cross-checked
//! against the upstream `pivy` reference implementation.

/// PIV application identifier, as sent in the SELECT command body.
pub const PIV_AID: &[u8] = &[
    0xA0, 0x00, 0x00, 0x03, 0x08, 0x00, 0x00, 0x10, 0x00, 0x01, 0x00,
];

// ISO 7816-4 class byte
pub const CLA_ISO: u8 = 0x00;
pub const CLA_CHAIN: u8 = 0x10;

// Instruction codes
pub const INS_SELECT: u8 = 0xA4;
pub const INS_GET_DATA: u8 = 0xCB;
pub const INS_VERIFY: u8 = 0x20;
pub const INS_CHANGE_PIN: u8 = 0x24;
pub const INS_RESET_PIN: u8 = 0x2C;
pub const INS_GEN_AUTH: u8 = 0x87;
pub const INS_PUT_DATA: u8 = 0xDB;
pub const INS_GEN_ASYM: u8 = 0x47;
pub const INS_CONTINUE: u8 = 0xC0;

/// YubicoPIV-specific instructions.
pub const INS_SET_MGMT: u8 = 0xFF;
pub const INS_IMPORT_ASYM: u8 = 0xFE;
pub const INS_GET_VERSION: u8 = 0xFD;
pub const INS_SET_PIN_RETRIES: u8 = 0xFA;
pub const INS_ATTEST: u8 = 0xF9;

pub const SEL_APP_AID: u8 = 0x04;

// SELECT response (Application Property Template) tags
pub const TAG_APT: u32 = 0x61;
pub const TAG_AID: u32 = 0x4F;
pub const TAG_AUTHORITY: u32 = 0x79;
pub const TAG_APP_LABEL: u32 = 0x50;
pub const TAG_URI: u32 = 0x5F50;
pub const TAG_ALGS: u32 = 0xAC;
pub const TAG_ALG_ID: u32 = 0x80;

// GET DATA request / container response tags
pub const TAG_GET_DATA_TAG_LIST: u32 = 0x5C;
pub const TAG_CONTAINER: u32 = 0x53;
pub const TAG_CERT: u32 = 0x70;
pub const TAG_CERT_COMPRESSION: u32 = 0x71;
pub const TAG_CERT_LRC: u32 = 0x72;
pub const TAG_CONTAINER_INTEGRITY: u32 = 0xFE;

// Data object tags (used as the value of TAG_GET_DATA_TAG_LIST)
pub const TAG_DISCOVERY: u32 = 0x7E;
pub const TAG_CARDCAP: u32 = 0x5FC107;
pub const TAG_CHUID: u32 = 0x5FC102;
pub const TAG_SECOBJ: u32 = 0x5FC106;
pub const TAG_KEYHIST: u32 = 0x5FC10C;
pub const TAG_CERT_9A: u32 = 0x5FC105;
pub const TAG_CERT_9C: u32 = 0x5FC10A;
pub const TAG_CERT_9D: u32 = 0x5FC10B;
pub const TAG_CERT_9E: u32 = 0x5FC101;
pub const TAG_CERT_RETIRED_FIRST: u32 = 0x5FC10D;
pub const TAG_CERT_RETIRED_LAST: u32 = 0x5FC120;
pub const TAG_CERT_ATTESTATION: u32 = 0x5FFF01;

// CHUID inner tags
pub const TAG_CHUID_FASCN: u32 = 0x30;
pub const TAG_CHUID_GUID: u32 = 0x34;
pub const TAG_CHUID_EXPIRY: u32 = 0x35;
pub const TAG_CHUID_SIGNATURE: u32 = 0x3E;

// Key history inner tags
pub const TAG_KEYHIST_ONCARD: u32 = 0xC1;
pub const TAG_KEYHIST_OFFCARD: u32 = 0xC2;
pub const TAG_KEYHIST_URL: u32 = 0xF3;

// Discovery object inner tags
pub const TAG_DISCOVERY_AID: u32 = 0x4F;
pub const TAG_DISCOVERY_POLICY: u32 = 0x5F2F;

// GENERAL AUTHENTICATE dynamic auth template
pub const TAG_DYN_AUTH: u32 = 0x7C;
pub const TAG_GA_WITNESS: u32 = 0x80;
pub const TAG_GA_CHALLENGE: u32 = 0x81;
pub const TAG_GA_RESPONSE: u32 = 0x82;
pub const TAG_GA_EXPONENTIATION: u32 = 0x85;

// GENERATE ASYMMETRIC request/response tags
pub const TAG_GEN_ALGORITHM: u32 = 0x80;
pub const TAG_GEN_PIN_POLICY: u32 = 0xAA;
pub const TAG_GEN_TOUCH_POLICY: u32 = 0xAB;
pub const TAG_PUBKEY_WRAPPER: u32 = 0x7F49;
pub const TAG_RSA_MODULUS: u32 = 0x81;
pub const TAG_RSA_EXPONENT: u32 = 0x82;
pub const TAG_EC_POINT: u32 = 0x86;

// YubicoPIV IMPORT ASYMMETRIC KEY (INS 0xFE) component tags: RSA CRT
// parameters and the raw EC private scalar, each sent as its own TLV in
// the command body (no outer 0xAC control template, unlike GENERATE).
pub const TAG_IMPORT_RSA_P: u32 = 0x01;
pub const TAG_IMPORT_RSA_Q: u32 = 0x02;
pub const TAG_IMPORT_RSA_DP: u32 = 0x03;
pub const TAG_IMPORT_RSA_DQ: u32 = 0x04;
pub const TAG_IMPORT_RSA_QINV: u32 = 0x05;
pub const TAG_IMPORT_EC_PRIVATE: u32 = 0x06;

/// Status word families. 0x61xx and 0x6Cxx carry a one-byte count in the low
/// byte and are handled transparently by the transport; the rest are
/// surfaced to callers via [`crate::Error::Apdu`].
pub mod sw {
    pub const SUCCESS: u16 = 0x9000;
    pub const BYTES_REMAINING_MASK: u16 = 0xFF00;
    pub const BYTES_REMAINING: u16 = 0x6100;
    pub const WARNING_EOF: u16 = 0x6282;
    pub const WRONG_LENGTH_MASK: u16 = 0xFF00;
    pub const WRONG_LENGTH: u16 = 0x6C00;
    pub const SECURITY_NOT_SATISFIED: u16 = 0x6982;
    pub const AUTH_BLOCKED: u16 = 0x6983;
    pub const PIN_INCORRECT_MASK: u16 = 0xFFF0;
    pub const PIN_INCORRECT: u16 = 0x63C0;
    pub const FILE_NOT_FOUND: u16 = 0x6A82;
    pub const FUNC_NOT_SUPPORTED: u16 = 0x6A81;
    pub const INCORRECT_P1P2: u16 = 0x6A86;
    pub const WRONG_DATA: u16 = 0x6A80;
    pub const CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
}

/// PIV/YubicoPIV algorithm identifiers (as used in `GENERATE`/`GENERAL
/// AUTHENTICATE` P1 and the discovery algorithm list).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AlgorithmId {
    Tdes,
    Rsa1024,
    Rsa2048,
    Aes128,
    Aes192,
    Aes256,
    EccP256,
    EccP384,
    /// Yubico PivApplet extension: raw message, card hashes with SHA-1.
    YkEccP256Sha1,
    /// Yubico PivApplet extension: raw message, card hashes with SHA-256.
    YkEccP256Sha256,
}

impl AlgorithmId {
    pub const fn to_byte(self) -> u8 {
        match self {
            AlgorithmId::Tdes => 0x03,
            AlgorithmId::Rsa1024 => 0x06,
            AlgorithmId::Rsa2048 => 0x07,
            AlgorithmId::Aes128 => 0x08,
            AlgorithmId::Aes192 => 0x0A,
            AlgorithmId::Aes256 => 0x0C,
            AlgorithmId::EccP256 => 0x11,
            AlgorithmId::EccP384 => 0x14,
            AlgorithmId::YkEccP256Sha1 => 0xF0,
            AlgorithmId::YkEccP256Sha256 => 0xF1,
        }
    }

    pub const fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x03 => AlgorithmId::Tdes,
            0x06 => AlgorithmId::Rsa1024,
            0x07 => AlgorithmId::Rsa2048,
            0x08 => AlgorithmId::Aes128,
            0x0A => AlgorithmId::Aes192,
            0x0C => AlgorithmId::Aes256,
            0x11 => AlgorithmId::EccP256,
            0x14 => AlgorithmId::EccP384,
            0xF0 => AlgorithmId::YkEccP256Sha1,
            0xF1 => AlgorithmId::YkEccP256Sha256,
            _ => return None,
        })
    }

    pub const fn is_rsa(self) -> bool {
        matches!(self, AlgorithmId::Rsa1024 | AlgorithmId::Rsa2048)
    }

    pub const fn is_ec(self) -> bool {
        matches!(
            self,
            AlgorithmId::EccP256
                | AlgorithmId::EccP384
                | AlgorithmId::YkEccP256Sha1
                | AlgorithmId::YkEccP256Sha256
        )
    }

    /// Whether this algorithm takes a raw (unhashed) message and hashes it
    /// on-card, as opposed to a caller-supplied digest/DigestInfo.
    pub const fn hashes_on_card(self) -> bool {
        matches!(
            self,
            AlgorithmId::YkEccP256Sha1 | AlgorithmId::YkEccP256Sha256
        )
    }
}

/// PIV key-slot identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    Authentication,
    CardManagement,
    Signature,
    KeyManagement,
    CardAuthentication,
    Retired(u8),
    Attestation,
}

impl SlotId {
    pub const fn to_byte(self) -> u8 {
        match self {
            SlotId::Authentication => 0x9A,
            SlotId::CardManagement => 0x9B,
            SlotId::Signature => 0x9C,
            SlotId::KeyManagement => 0x9D,
            SlotId::CardAuthentication => 0x9E,
            SlotId::Retired(n) => n,
            SlotId::Attestation => 0xF9,
        }
    }

    pub const fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x9A => SlotId::Authentication,
            0x9B => SlotId::CardManagement,
            0x9C => SlotId::Signature,
            0x9D => SlotId::KeyManagement,
            0x9E => SlotId::CardAuthentication,
            0xF9 => SlotId::Attestation,
            0x82..=0x95 => SlotId::Retired(b),
            _ => return None,
        })
    }

    /// The GET DATA / PUT DATA object tag for this slot's certificate
    /// container.
    pub const fn cert_tag(self) -> u32 {
        match self {
            SlotId::Authentication => TAG_CERT_9A,
            SlotId::Signature => TAG_CERT_9C,
            SlotId::KeyManagement => TAG_CERT_9D,
            SlotId::CardAuthentication => TAG_CERT_9E,
            SlotId::Attestation => TAG_CERT_ATTESTATION,
            SlotId::CardManagement => 0, // admin slot has no certificate container
            SlotId::Retired(n) => TAG_CERT_RETIRED_FIRST + (n as u32 - 0x82),
        }
    }

    /// All slot ids that can hold an asymmetric key + certificate
    /// (excludes the admin slot 9B, which holds only a symmetric key).
    pub fn all_key_slots() -> Vec<SlotId> {
        let mut v = vec![
            SlotId::Authentication,
            SlotId::Signature,
            SlotId::KeyManagement,
            SlotId::CardAuthentication,
        ];
        v.extend((0x82u8..=0x95).map(SlotId::Retired));
        v.push(SlotId::Attestation);
        v
    }
}

/// PIN/PUK reference values for VERIFY/CHANGE/RESET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinRef {
    Application,
    Global,
    Puk,
    /// On-card biometric comparison (0x96). Defined by SP 800-73 but
    /// unsupported here: reading/verifying it always returns `not-supported`.
    Occ,
    /// Secondary on-card biometric reference (0x97). Same treatment as
    /// [`PinRef::Occ`].
    Occ2,
    /// Pairing code (0x98), used only for contactless pairing. Same
    /// treatment as [`PinRef::Occ`].
    Pairing,
}

impl PinRef {
    pub const fn to_byte(self) -> u8 {
        match self {
            PinRef::Application => 0x80,
            PinRef::Global => 0x00,
            PinRef::Puk => 0x81,
            PinRef::Occ => 0x96,
            PinRef::Occ2 => 0x97,
            PinRef::Pairing => 0x98,
        }
    }

    pub const fn is_supported(self) -> bool {
        matches!(self, PinRef::Application | PinRef::Global | PinRef::Puk)
    }
}

/// YubicoPIV PIN policy for `GENERATE`/`IMPORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinPolicy {
    #[default]
    Default,
    Never,
    Once,
    Always,
}

impl PinPolicy {
    pub const fn to_byte(self) -> u8 {
        match self {
            PinPolicy::Default => 0x00,
            PinPolicy::Never => 0x01,
            PinPolicy::Once => 0x02,
            PinPolicy::Always => 0x03,
        }
    }
}

/// YubicoPIV touch policy for `GENERATE`/`IMPORT`/`SET MANAGEMENT KEY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TouchPolicy {
    #[default]
    Default,
    Never,
    Always,
    Cached,
}

impl TouchPolicy {
    pub const fn to_byte(self) -> u8 {
        match self {
            TouchPolicy::Default => 0x00,
            TouchPolicy::Never => 0x01,
            TouchPolicy::Always => 0x02,
            TouchPolicy::Cached => 0x03,
        }
    }
}
