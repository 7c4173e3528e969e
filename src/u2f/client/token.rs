use std::collections::HashMap;
use std::time::Duration;

use ring::{
    rand::{self, SecureRandom},
    signature::{self, EcdsaKeyPair, KeyPair},
};
use tracing::{debug, trace};

use crate::u2f::{
    error::Error,
    proto::{
        codec,
        constants::*,
        raw_message::{
            apdu,
            AuthenticateRequest,
            AuthenticateResponse,
            Message,
            RegisterRequest,
            RegisterResponse,
            VersionRequest,
            VersionResponse,
        },
    },
    transport::RawTransport,
};

/// Key handles minted by the soft token are this long.
pub const SOFT_KEY_HANDLE_SIZE: usize = 64;

/// tbsCertificate of the attestation certificate up to, but excluding, the 65 byte public key.
/// Serial 1, issuer and subject `O=U2F`/`CN=U2F`, valid 2000-01-01 to 2099-12-31.
const ATTESTATION_TBS_PREFIX: &str = "3081B3A003020102020101300A06082A8648CE3D040302300E310C300A060355040A0C035532463022180F32303030303130313030303030305A180F32303939313233313233353935395A300E310C300A060355040313035532463059301306072A8648CE3D020106082A8648CE3D030107034200";

const ECDSA_SHA256_ALG_ID: [u8; 12] = [0x30, 0x0a, 0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02];

const PRESENCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct SigningKey {
    pub application: [u8; U2F_APPID_SIZE],
    pub private_key: Vec<u8>,
}

pub trait KeyStore {
    fn contains(&self, handle: &[u8]) -> bool {
        self.load(handle).is_some()
    }
    fn load(&self, handle: &[u8]) -> Option<&SigningKey>;
    fn save(&mut self, handle: Vec<u8>, key: SigningKey) -> bool;
}

pub trait PresenceValidator {
    fn check_user_presence(&mut self, timeout: Duration) -> bool;
}

#[derive(Default)]
pub struct MemoryKeyStore {
    keys: HashMap<Vec<u8>, SigningKey>,
}

impl KeyStore for MemoryKeyStore {
    fn load(&self, handle: &[u8]) -> Option<&SigningKey> {
        self.keys.get(handle)
    }

    fn save(&mut self, handle: Vec<u8>, key: SigningKey) -> bool {
        self.keys.insert(handle, key);
        true
    }
}

/// A token whose button is always pressed.
pub struct AlwaysPresent;

impl PresenceValidator for AlwaysPresent {
    fn check_user_presence(&mut self, _timeout: Duration) -> bool {
        true
    }
}

impl<F: FnMut(Duration) -> bool> PresenceValidator for F {
    fn check_user_presence(&mut self, timeout: Duration) -> bool {
        self(timeout)
    }
}

/// Builds a self-signed P-256 attestation certificate for `pkcs8`.
pub fn self_signed_certificate(pkcs8: &[u8]) -> Result<Vec<u8>, Error> {
    let rng = rand::SystemRandom::new();
    let key_pair = EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8, &rng)?;

    let mut tbs = codec::from_hex(ATTESTATION_TBS_PREFIX)?;
    tbs.extend_from_slice(key_pair.public_key().as_ref());

    let sig = key_pair.sign(&rng, &tbs)?;
    let sig = sig.as_ref();

    let mut content = tbs;
    content.extend_from_slice(&ECDSA_SHA256_ALG_ID);
    content.push(ASN1_BIT_STRING_TYPE);
    content.push((sig.len() + 1) as u8);
    content.push(0x00);
    content.extend_from_slice(sig);

    let mut cert = vec![ASN1_SEQ_TYPE, ASN1_LEN_TWO_BYTES];
    cert.extend_from_slice(&codec::u16_be(content.len() as u16));
    cert.extend_from_slice(&content);
    Ok(cert)
}

pub fn register(
    req: RegisterRequest,
    key_handle: Vec<u8>,
    attestation_cert: &[u8],
    attestation_key: &[u8],
) -> Result<(RegisterResponse, SigningKey), Error> {
    let RegisterRequest { challenge, application } = req;

    // Generate a key pair in PKCS#8 (v2) format.
    let rng = rand::SystemRandom::new();
    let registered_key_pkcs8_doc = EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, &rng)?;
    let registered_key_pkcs8_bytes = registered_key_pkcs8_doc.as_ref();

    let registered_key_pair = EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, registered_key_pkcs8_bytes, &rng)?;
    let mut user_public_key = [0u8; U2F_EC_POINT_SIZE];
    user_public_key.copy_from_slice(registered_key_pair.public_key().as_ref());

    let mut tbs_vec = Vec::with_capacity(U2F_REGISTER_MAX_DATA_TBS_SIZE);
    tbs_vec.push(U2F_REGISTER_HASH_ID);
    tbs_vec.extend_from_slice(&application);
    tbs_vec.extend_from_slice(&challenge);
    tbs_vec.extend_from_slice(&key_handle);
    tbs_vec.extend_from_slice(&user_public_key);

    let att_key_pair = EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, attestation_key, &rng)?;
    let sig = att_key_pair.sign(&rng, tbs_vec.as_slice())?;

    let mut key_handle_cert_sig = Vec::with_capacity(key_handle.len() + attestation_cert.len() + U2F_MAX_EC_SIG_SIZE);
    key_handle_cert_sig.extend_from_slice(&key_handle);
    key_handle_cert_sig.extend_from_slice(attestation_cert);
    key_handle_cert_sig.extend_from_slice(sig.as_ref());

    Ok((
        RegisterResponse {
            register_id: U2F_REGISTER_ID,
            user_public_key,
            key_handle_len: key_handle.len() as u8,
            key_handle_cert_sig,
        },
        SigningKey {
            application,
            private_key: registered_key_pkcs8_bytes.to_vec(),
        },
    ))
}

pub fn sign(req: AuthenticateRequest, signing_key: &SigningKey, counter: u32, user_presence: bool) -> Result<AuthenticateResponse, Error> {
    let AuthenticateRequest {
        challenge, application, ..
    } = req;

    let user_presence = if user_presence { U2F_AUTH_FLAG_TUP } else { U2F_AUTH_FLAG_TDOWN };

    let rng = rand::SystemRandom::new();
    let key_pair = EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, signing_key.private_key.as_slice(), &rng)?;

    let mut tbs_vec = Vec::with_capacity(U2F_AUTH_MAX_DATA_TBS_SIZE);
    tbs_vec.extend_from_slice(&application);
    tbs_vec.push(user_presence);
    tbs_vec.extend_from_slice(&counter.to_be_bytes());
    tbs_vec.extend_from_slice(&challenge);

    let sig = key_pair.sign(&rng, tbs_vec.as_slice())?;

    Ok(AuthenticateResponse {
        user_presence,
        counter,
        signature: sig.as_ref().to_vec(),
    })
}

/// Software U2F token speaking ISO 7816-4 on the card side.
///
/// It answers the applet SELECT, reassembles chained commands, splits long responses to short
/// commands with `61XX`, and serves them back through GET RESPONSE.
pub struct SoftToken {
    store: Box<dyn KeyStore>,
    presence_validator: Box<dyn PresenceValidator>,
    attestation_cert: Vec<u8>,
    attestation_key: Vec<u8>,
    counter: u32,
    chain: Option<(u8, u8, u8, Vec<u8>)>,
    pending: Vec<u8>,
}

impl SoftToken {
    pub fn new(store: impl KeyStore + 'static, presence_validator: impl PresenceValidator + 'static) -> Result<Self, Error> {
        let rng = rand::SystemRandom::new();
        let attestation_key = EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, &rng)?
            .as_ref()
            .to_vec();
        let attestation_cert = self_signed_certificate(&attestation_key)?;

        Ok(SoftToken {
            store: Box::new(store),
            presence_validator: Box::new(presence_validator),
            attestation_cert,
            attestation_key,
            counter: 0,
            chain: None,
            pending: Vec::new(),
        })
    }

    /// A token with an in-memory key store and a button that is always pressed.
    pub fn simple() -> Result<Self, Error> {
        Self::new(MemoryKeyStore::default(), AlwaysPresent)
    }

    pub fn attestation_cert(&self) -> &[u8] {
        &self.attestation_cert
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn handle_apdu_request(&mut self, req: apdu::Request) -> apdu::Response {
        self.handle_apdu_request_with_timeout(req, Some(PRESENCE_TIMEOUT))
    }

    pub fn handle_apdu_request_with_timeout(&mut self, req: apdu::Request, timeout: Option<Duration>) -> apdu::Response {
        let timeout = timeout.unwrap_or(PRESENCE_TIMEOUT);

        if req.class_byte != ISO_CLA {
            return apdu::Response::from_status(U2F_SW_CLA_NOT_SUPPORTED);
        }

        let res = match req.command_mode {
            ISO_INS_SELECT => self.select(req),
            U2F_REGISTER => RegisterRequest::from_apdu(req).and_then(|reg| self.register(reg, timeout).and_then(|rsp| rsp.into_apdu())),
            U2F_AUTHENTICATE => {
                AuthenticateRequest::from_apdu(req).and_then(|auth| self.authenticate(auth, timeout).and_then(|rsp| rsp.into_apdu()))
            }
            U2F_VERSION => VersionRequest::from_apdu(req).and_then(|vers| self.version(vers).into_apdu()),
            U2F_VENDOR_ECHO => Ok(apdu::Response::new(req.data.unwrap_or_default(), U2F_SW_NO_ERROR)),
            _ => Err(Error::U2FErrorCode(U2F_SW_INS_NOT_SUPPORTED)),
        };

        match res {
            Ok(rsp) => rsp,
            Err(Error::U2FErrorCode(sw)) => apdu::Response::from_status(sw),
            Err(e) => {
                debug!("rejecting command: {}", e);
                apdu::Response::from_status(U2F_SW_WRONG_LENGTH)
            }
        }
    }

    fn select(&mut self, req: apdu::Request) -> Result<apdu::Response, Error> {
        if req.param_1 != ISO_SELECT_BY_AID || req.data() != U2F_APPLET_AID {
            return Err(Error::U2FErrorCode(U2F_SW_FILE_NOT_FOUND));
        }

        Ok(apdu::Response::new(U2F_V2_VERSION_STR.as_bytes().to_vec(), U2F_SW_NO_ERROR))
    }

    fn register(&mut self, req: RegisterRequest, timeout: Duration) -> Result<RegisterResponse, Error> {
        if !self.presence_validator.check_user_presence(timeout) {
            return Err(Error::U2FErrorCode(U2F_SW_CONDITIONS_NOT_SATISFIED));
        }

        let mut key_handle = vec![0u8; SOFT_KEY_HANDLE_SIZE];
        rand::SystemRandom::new().fill(&mut key_handle)?;

        let (rsp, signing_key) = register(req, key_handle.clone(), &self.attestation_cert, &self.attestation_key)?;

        if self.store.save(key_handle, signing_key) {
            Ok(rsp)
        } else {
            Err(Error::Other("U2F Register: Unable to save private key".to_string()))
        }
    }

    fn authenticate(&mut self, req: AuthenticateRequest, timeout: Duration) -> Result<AuthenticateResponse, Error> {
        let signing_key = match self.store.load(&req.key_handle) {
            Some(key) if key.application == req.application => key.clone(),
            _ => return Err(Error::U2FErrorCode(U2F_SW_WRONG_DATA)),
        };

        match req.control {
            U2F_AUTH_CHECK_ONLY => Err(Error::U2FErrorCode(U2F_SW_CONDITIONS_NOT_SATISFIED)),
            U2F_AUTH_ENFORCE | U2F_AUTH_DONT_ENFORCE => {
                let user_presence = self.presence_validator.check_user_presence(timeout);
                if !user_presence && req.control == U2F_AUTH_ENFORCE {
                    return Err(Error::U2FErrorCode(U2F_SW_CONDITIONS_NOT_SATISFIED));
                }

                self.counter = self.counter.wrapping_add(1);
                sign(req, &signing_key, self.counter, user_presence)
            }
            _ => Err(Error::U2FErrorCode(U2F_SW_WRONG_DATA)),
        }
    }

    fn version(&self, _: VersionRequest) -> VersionResponse {
        VersionResponse {
            version: U2F_V2_VERSION_STR.to_string(),
        }
    }

    /// Card side of one C-APDU/R-APDU pair.
    pub fn process(&mut self, capdu: &[u8]) -> Vec<u8> {
        let (mut req, case) = match apdu::Request::decode(capdu) {
            Ok(decoded) => decoded,
            Err(_) => return apdu::Response::from_status(U2F_SW_WRONG_LENGTH).to_bytes(),
        };
        trace!("card received {:?} INS 0x{:02x}", case, req.command_mode);

        if req.class_byte == ISO_CLA && req.command_mode == ISO_INS_GET_RESPONSE && !self.pending.is_empty() {
            let le = req.max_rsp_len.unwrap_or(MAX_RESPONSE_LEN_SHORT);
            return self.next_chunk(le, U2F_SW_NO_ERROR);
        }
        self.pending.clear();

        if req.class_byte & ISO_CLA_CHAINING != 0 {
            let (cla, ins, p1) = (req.class_byte & !ISO_CLA_CHAINING, req.command_mode, req.param_1);
            match self.chain.as_mut() {
                Some((c, i, p, buf)) if (*c, *i, *p) == (cla, ins, p1) => buf.extend_from_slice(req.data()),
                _ => self.chain = Some((cla, ins, p1, req.data().to_vec())),
            }
            return apdu::Response::from_status(U2F_SW_NO_ERROR).to_bytes();
        }

        if let Some((cla, ins, p1, mut buf)) = self.chain.take() {
            if (cla, ins, p1) != (req.class_byte, req.command_mode, req.param_1) {
                return apdu::Response::from_status(U2F_SW_COMMAND_NOT_ALLOWED).to_bytes();
            }
            buf.extend_from_slice(req.data());
            req.data = Some(buf);
        }

        let le = req.max_rsp_len.unwrap_or(MAX_RESPONSE_LEN_SHORT);
        let rsp = self.handle_apdu_request(req);

        if case.is_extended() || rsp.body().len() <= le {
            return rsp.to_bytes();
        }

        self.pending = rsp.body().to_vec();
        self.next_chunk(le, rsp.status)
    }

    fn next_chunk(&mut self, le: usize, final_status: u16) -> Vec<u8> {
        let take = le.min(self.pending.len());
        let chunk: Vec<u8> = self.pending.drain(..take).collect();

        let status = match self.pending.len() {
            0 => final_status,
            remaining if remaining > 0xff => codec::status_word(U2F_SW_BYTES_REMAINING, 0x00),
            remaining => codec::status_word(U2F_SW_BYTES_REMAINING, remaining as u8),
        };

        apdu::Response::new(chunk, status).to_bytes()
    }
}

impl RawTransport for SoftToken {
    fn connect(&mut self) -> Result<(), Error> {
        self.chain = None;
        self.pending.clear();
        Ok(())
    }

    fn transmit(&mut self, capdu: &[u8], _max_response: usize) -> Result<Vec<u8>, Error> {
        Ok(self.process(capdu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::u2f::proto::asn1;
    use crate::u2f::verifier;

    fn register_apdu() -> Vec<u8> {
        let req = RegisterRequest {
            challenge: [0u8; 32],
            application: [0u8; 32],
        };
        req.into_apdu().unwrap().encode().unwrap()
    }

    #[test]
    fn attestation_certificate_is_self_signed() {
        let token = SoftToken::simple().unwrap();
        let cert = token.attestation_cert();

        assert_eq!(cert[0], ASN1_SEQ_TYPE);
        assert_eq!(cert[1], ASN1_LEN_TWO_BYTES);
        assert!(verifier::is_self_signed(cert).unwrap());
        assert_eq!(asn1::extract_tbs_certificate(cert).unwrap().len(), 182);
    }

    #[test]
    fn select_answers_version() {
        let mut token = SoftToken::simple().unwrap();
        let mut select = vec![0x00, ISO_INS_SELECT, ISO_SELECT_BY_AID, 0x00, 0x08];
        select.extend_from_slice(&U2F_APPLET_AID);
        assert_eq!(token.process(&select), b"U2F_V2\x90\x00".to_vec());

        select[6] ^= 0xff;
        assert_eq!(token.process(&select), vec![0x6a, 0x82]);
    }

    #[test]
    fn status_words_for_bad_commands() {
        let mut token = SoftToken::simple().unwrap();
        assert_eq!(token.process(&[0x00, 0x55, 0x00, 0x00]), vec![0x6d, 0x00]);
        assert_eq!(token.process(&[0x80, U2F_VERSION, 0x00, 0x00]), vec![0x6e, 0x00]);
        assert_eq!(token.process(&[0x00, U2F_REGISTER, 0x03, 0x00, 0x00, 0x00, 0x00]), vec![0x67, 0x00]);
        assert_eq!(token.process(&[0x00, U2F_VERSION, 0x00, 0x00, 0x01, 0xaa]), vec![0x67, 0x00]);
        assert_eq!(token.process(&[0x00]), vec![0x67, 0x00]);
    }

    #[test]
    fn extended_register_returns_everything() {
        let mut token = SoftToken::simple().unwrap();
        let rapdu = token.process(&register_apdu());
        let (body, sw) = codec::split_status(&rapdu).unwrap();
        assert_eq!(sw, U2F_SW_NO_ERROR);

        let rsp = RegisterResponse::from_bytes(body).unwrap();
        assert_eq!(rsp.key_handle_len as usize, SOFT_KEY_HANDLE_SIZE);
        assert_eq!(asn1::extract_certificate(&rsp).unwrap(), token.attestation_cert());
    }

    #[test]
    fn short_register_is_served_in_chunks() {
        let mut token = SoftToken::simple().unwrap();
        let mut capdu = vec![0x00, U2F_REGISTER, 0x03, 0x00, 0x40];
        capdu.extend_from_slice(&[0u8; 64]);
        capdu.push(0x00);

        let first = token.process(&capdu);
        assert_eq!(first.len(), 258);
        assert_eq!(first[256], U2F_SW_BYTES_REMAINING);

        let mut body = first[..256].to_vec();
        loop {
            let rapdu = token.process(&[0x00, ISO_INS_GET_RESPONSE, 0x00, 0x00, 0x00]);
            let (more, sw) = codec::split_status(&rapdu).unwrap();
            body.extend_from_slice(more);
            if sw == U2F_SW_NO_ERROR {
                break;
            }
            assert_eq!((sw >> 8) as u8, U2F_SW_BYTES_REMAINING);
        }

        assert!(RegisterResponse::from_bytes(&body).is_ok());
    }

    #[test]
    fn chained_echo_is_reassembled() {
        let mut token = SoftToken::simple().unwrap();
        assert_eq!(token.process(&[0x10, U2F_VENDOR_ECHO, 0x00, 0x00, 0x02, 0x01, 0x02]), vec![0x90, 0x00]);
        assert_eq!(token.process(&[0x00, U2F_VENDOR_ECHO, 0x00, 0x00, 0x01, 0x03, 0x00]), vec![0x01, 0x02, 0x03, 0x90, 0x00]);
    }

    #[test]
    fn check_only_and_presence() {
        let mut presses = vec![true, false];
        let mut token = SoftToken::new(MemoryKeyStore::default(), move |_: Duration| presses.pop().unwrap_or(false)).unwrap();

        // No touch yet.
        assert_eq!(token.process(&register_apdu()), vec![0x69, 0x85]);
        let rapdu = token.process(&register_apdu());
        let (body, sw) = codec::split_status(&rapdu).unwrap();
        assert_eq!(sw, U2F_SW_NO_ERROR);
        let reg = RegisterResponse::from_bytes(body).unwrap();

        let auth = |control| AuthenticateRequest {
            control,
            challenge: [1u8; 32],
            application: [0u8; 32],
            key_handle: reg.key_handle().unwrap().to_vec(),
        };

        let capdu = auth(U2F_AUTH_CHECK_ONLY).into_apdu().unwrap().encode().unwrap();
        assert_eq!(token.process(&capdu), vec![0x69, 0x85]);

        let capdu = auth(U2F_AUTH_ENFORCE).into_apdu().unwrap().encode().unwrap();
        assert_eq!(token.process(&capdu), vec![0x69, 0x85]);
        assert_eq!(token.counter(), 0);

        let mut wrong_app = auth(U2F_AUTH_ENFORCE);
        wrong_app.application = [9u8; 32];
        let capdu = wrong_app.into_apdu().unwrap().encode().unwrap();
        assert_eq!(token.process(&capdu), vec![0x6a, 0x80]);
    }
}
