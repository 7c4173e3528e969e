#![allow(dead_code)]

pub const MAX_RESPONSE_LEN_SHORT: usize = 256;
pub const MAX_RESPONSE_LEN_EXTENDED: usize = 65536;
pub const MAX_COMMAND_DATA_EXTENDED: usize = 65535;

pub const U2F_V2_VERSION_STR: &str = "U2F_V2";

// From :Common U2F raw message format header - Review Draft
// 2014-10-08

// ASN1 constants

pub const ASN1_SEQ_TYPE: u8 = 0x30;
pub const ASN1_INTEGER_TYPE: u8 = 0x02;
pub const ASN1_BIT_STRING_TYPE: u8 = 0x03;
pub const ASN1_DEFINITE_SHORT_MASK: u8 = 0x80;
pub const ASN1_LEN_ONE_BYTE: u8 = 0x81;
pub const ASN1_LEN_TWO_BYTES: u8 = 0x82;

/// SubjectPublicKeyInfo lead-in for an uncompressed P-256 key:
/// `SEQUENCE { SEQUENCE { id-ecPublicKey, prime256v1 }, BIT STRING (66 bytes, 0 unused bits) }`.
/// The 65-byte point follows immediately.
pub const ASN1_P256_SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03,
    0x01, 0x07, 0x03, 0x42, 0x00,
];

/// `AlgorithmIdentifier { ecdsa-with-SHA256 }` followed by the BIT STRING tag of the certificate
/// signature value.
pub const ASN1_ECDSA_SHA256_SIG_PREFIX: [u8; 13] = [0x30, 0x0a, 0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02, 0x03];

// General constants

pub const U2F_EC_KEY_SIZE: usize = 32; // EC key size in bytes
pub const U2F_EC_POINT_SIZE: usize = (U2F_EC_KEY_SIZE * 2) + 1; // Size of EC point
pub const U2F_MIN_KH_SIZE: usize = 32; // Min size of key handle
pub const U2F_MAX_KH_SIZE: usize = 255; // Max size of key handle
pub const U2F_MAX_ATT_CERT_SIZE: usize = 2048; // Max size of attestation certificate
pub const U2F_MAX_EC_SIG_SIZE: usize = 72; // Max size of DER coded EC signature
pub const U2F_CTR_SIZE: usize = 4; // Size of counter field
pub const U2F_APPID_SIZE: usize = 32; // Size of application id
pub const U2F_CHAL_SIZE: usize = 32; // Size of challenge
pub const U2F_REGISTER_MAX_DATA_TBS_SIZE: usize = 1 + U2F_APPID_SIZE + U2F_CHAL_SIZE + U2F_MAX_KH_SIZE + U2F_EC_POINT_SIZE;
pub const U2F_AUTH_MAX_DATA_TBS_SIZE: usize = U2F_APPID_SIZE + 1 + U2F_CTR_SIZE + U2F_CHAL_SIZE;

/// Largest well-formed REGISTER response body.
pub const U2F_REGISTER_RSP_MAX_SIZE: usize = 1 + U2F_EC_POINT_SIZE + 1 + U2F_MAX_KH_SIZE + U2F_MAX_ATT_CERT_SIZE + U2F_MAX_EC_SIG_SIZE;
/// Largest well-formed AUTHENTICATE response body.
pub const U2F_AUTH_RSP_MAX_SIZE: usize = 1 + U2F_CTR_SIZE + U2F_MAX_EC_SIG_SIZE;

// EC (uncompressed) point

pub const U2F_POINT_UNCOMPRESSED: u8 = 0x04; // Uncompressed point format

// ISO 7816-4 class and instruction bytes

pub const ISO_CLA: u8 = 0x00;
pub const ISO_CLA_CHAINING: u8 = 0x10; // Command chaining bit
pub const ISO_INS_SELECT: u8 = 0xa4;
pub const ISO_INS_GET_RESPONSE: u8 = 0xc0;
pub const ISO_SELECT_BY_AID: u8 = 0x04;

pub const U2F_APPLET_AID: [u8; 8] = [0xa0, 0x00, 0x00, 0x06, 0x47, 0x2f, 0x00, 0x01];

// U2F native commands

pub const U2F_REGISTER: u8 = 0x01; // Registration command
pub const U2F_AUTHENTICATE: u8 = 0x02; // Authenticate/sign command
pub const U2F_VERSION: u8 = 0x03; // Read version string command

pub const U2F_VENDOR_FIRST: u8 = 0x40; // First vendor defined command
pub const U2F_VENDOR_LAST: u8 = 0xbf; // Last vendor defined command
pub const U2F_VENDOR_ECHO: u8 = U2F_VENDOR_FIRST; // Echo payload back (soft token only)

// U2F_CMD_REGISTER command defines

pub const U2F_REGISTER_ID: u8 = 0x05; // Version 2 registration identifier
pub const U2F_REGISTER_HASH_ID: u8 = 0x00; // Version 2 hash identintifier

// U2F_CMD_AUTHENTICATE command defines

// Authentication control byte

pub const U2F_AUTH_DONT_ENFORCE: u8 = 0x08;
pub const U2F_AUTH_ENFORCE: u8 = 0x03; // Enforce user presence and sign
pub const U2F_AUTH_CHECK_ONLY: u8 = 0x07; // Check only
pub const U2F_AUTH_FLAG_TUP: u8 = 0x01; // Test of user presence set
pub const U2F_AUTH_FLAG_TDOWN: u8 = 0x00; // Test of user presence not set

// Command status responses

pub const U2F_SW_NO_ERROR: u16 = 0x9000; // SW_NO_ERROR
pub const U2F_SW_BYTES_REMAINING: u8 = 0x61; // SW1 of SW_BYTES_REMAINING_00
pub const U2F_SW_WRONG_DATA: u16 = 0x6A80; // SW_WRONG_DATA
pub const U2F_SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985; // SW_CONDITIONS_NOT_SATISFIED
pub const U2F_SW_COMMAND_NOT_ALLOWED: u16 = 0x6986; // SW_COMMAND_NOT_ALLOWED
pub const U2F_SW_WRONG_LENGTH: u16 = 0x6700; //SW_WRONG_LENGTH
pub const U2F_SW_FILE_NOT_FOUND: u16 = 0x6A82; //SW_FILE_NOT_FOUND
pub const U2F_SW_CLA_NOT_SUPPORTED: u16 = 0x6E00; //SW_CLA_NOT_SUPPORTED
pub const U2F_SW_INS_NOT_SUPPORTED: u16 = 0x6D00; // SW_INS_NOT_SUPPORTED

/// NFC transaction time limit in milliseconds.
pub const NFC_TIMEOUT_MS: u64 = 800;
