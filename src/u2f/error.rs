use std::error::Error as StdError;
use std::fmt::{Display, Formatter};
use std::io::Error as IoError;

use ring::error::{KeyRejected, Unspecified};
use serde_json::Error as JsonError;

/// Failures of the physical exchange or of the chaining rules layered on top of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Io(String),
    ChainViolation(String),
    Overflow { needed: usize, capacity: usize },
    /// `Le` outside `1..=max` for the APDU form being built.
    InvalidLe { le: usize, max: usize },
    Hid(u8),
    Closed,
}

/// Structural problems in a device response. Parsing never guesses past one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedResponse {
    ShortResponse { expected: usize, actual: usize },
    KeyHandleLength(usize),
    MalformedCertificate(String),
    MalformedSignature(String),
    KeyNotFound,
    SignatureNotFound,
    Truncated { needed: usize, available: usize },
    LengthMismatch { declared: usize, actual: usize },
    InvalidInteger,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoMismatch {
    RegisterId(u8),
    PointFormat(u8),
    UserPresence(u8),
    InvalidPublicKey,
    Signature,
}

#[derive(Debug)]
pub enum Error {
    IoError(IoError),
    Transport(TransportError),
    MalformedResponse(MalformedResponse),
    CryptoMismatch(CryptoMismatch),
    ProtocolViolation(String),
    U2FErrorCode(u16),
    UnexpectedApdu(String),
    MalformedApdu,
    JsonError(JsonError),
    RingKeyRejected(KeyRejected),
    Config(String),
    Aborted(String),
    Other(String),
}

impl Error {
    /// Structural precheck failures are reported apart from signature failures.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::CryptoMismatch(CryptoMismatch::RegisterId(_))
                | Error::CryptoMismatch(CryptoMismatch::PointFormat(_))
                | Error::CryptoMismatch(CryptoMismatch::UserPresence(_))
                | Error::MalformedResponse(_)
        )
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::IoError(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<MalformedResponse> for Error {
    fn from(e: MalformedResponse) -> Self {
        Error::MalformedResponse(e)
    }
}

impl From<CryptoMismatch> for Error {
    fn from(e: CryptoMismatch) -> Self {
        Error::CryptoMismatch(e)
    }
}

impl From<u16> for Error {
    fn from(sw: u16) -> Self {
        Error::U2FErrorCode(sw)
    }
}

impl From<JsonError> for Error {
    fn from(e: JsonError) -> Self {
        Error::JsonError(e)
    }
}

impl From<Unspecified> for Error {
    fn from(_: Unspecified) -> Self {
        Error::Other("Unspecified".to_string())
    }
}

impl From<KeyRejected> for Error {
    fn from(e: KeyRejected) -> Self {
        Error::RingKeyRejected(e)
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        use TransportError::*;
        match self {
            Timeout => write!(f, "transport timeout"),
            Io(s) => write!(f, "transport I/O failure: {}", s),
            ChainViolation(s) => write!(f, "chaining violation: {}", s),
            Overflow { needed, capacity } => write!(f, "response buffer overflow: {} bytes, capacity {}", needed, capacity),
            InvalidLe { le, max } => write!(f, "invalid Le {}, expected 1 to {}", le, max),
            Hid(code) => write!(f, "U2FHID error frame 0x{:02x}", code),
            Closed => write!(f, "session is closed"),
        }
    }
}

impl Display for MalformedResponse {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        use MalformedResponse::*;
        match self {
            ShortResponse { expected, actual } => write!(f, "response too short: expected at least {} bytes, got {}", expected, actual),
            KeyHandleLength(len) => write!(f, "invalid key handle length {}", len),
            MalformedCertificate(s) => write!(f, "malformed certificate: {}", s),
            MalformedSignature(s) => write!(f, "malformed signature: {}", s),
            KeyNotFound => write!(f, "P-256 subject public key not found in certificate"),
            SignatureNotFound => write!(f, "ECDSA-SHA256 signature not found in certificate"),
            Truncated { needed, available } => write!(f, "truncated: needed {} bytes, {} available", needed, available),
            LengthMismatch { declared, actual } => write!(f, "length mismatch: declared {}, actual {}", declared, actual),
            InvalidInteger => write!(f, "invalid DER integer"),
        }
    }
}

impl Display for CryptoMismatch {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        use CryptoMismatch::*;
        match self {
            RegisterId(id) => write!(f, "registration id 0x{:02x}, expected 0x05", id),
            PointFormat(fmt) => write!(f, "point format 0x{:02x}, expected uncompressed 0x04", fmt),
            UserPresence(flags) => write!(f, "user presence flag not set (flags 0x{:02x})", flags),
            InvalidPublicKey => write!(f, "public key is not a valid P-256 point"),
            Signature => write!(f, "signature does not verify"),
        }
    }
}

impl StdError for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        use Error::*;
        match self {
            IoError(io_e) => io_e.fmt(f),
            Transport(t_e) => t_e.fmt(f),
            MalformedResponse(m_e) => m_e.fmt(f),
            CryptoMismatch(c_e) => c_e.fmt(f),
            ProtocolViolation(s) => write!(f, "protocol violation: {}", s),
            U2FErrorCode(sw) => write!(f, "status word 0x{:04X}", sw),
            UnexpectedApdu(s) => write!(f, "{}", s),
            MalformedApdu => write!(f, "Malformed APDU"),
            JsonError(js_e) => js_e.fmt(f),
            RingKeyRejected(k_e) => k_e.fmt(f),
            Config(s) => write!(f, "configuration error: {}", s),
            Aborted(s) => write!(f, "aborted: {}", s),
            Other(s) => write!(f, "{}", s),
        }
    }
}
