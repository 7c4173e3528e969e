//! Attestation and authentication signature checks.
//!
//! The `verify_*` functions answer with a plain `bool`. Their `check_*` counterparts return the
//! reason, so a caller can tell a malformed response from a signature that does not verify.

use ring::signature;
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use crate::u2f::error::{CryptoMismatch, Error, MalformedResponse};
use crate::u2f::proto::asn1;
use crate::u2f::proto::codec::to_hex;
use crate::u2f::proto::constants::*;
use crate::u2f::proto::raw_message::{AuthenticateRequest, AuthenticateResponse, RegisterRequest, RegisterResponse};

/// `0x00 ‖ appId ‖ challenge ‖ keyHandle ‖ userPublicKey`
pub fn registration_signed_data(req: &RegisterRequest, rsp: &RegisterResponse) -> Result<Vec<u8>, Error> {
    let key_handle = rsp.key_handle()?;

    let mut data = Vec::with_capacity(U2F_REGISTER_MAX_DATA_TBS_SIZE);
    data.push(U2F_REGISTER_HASH_ID);
    data.extend_from_slice(&req.application);
    data.extend_from_slice(&req.challenge);
    data.extend_from_slice(key_handle);
    data.extend_from_slice(&rsp.user_public_key);
    Ok(data)
}

/// `appId ‖ flags ‖ counter (big-endian) ‖ challenge`
pub fn authentication_signed_data(reg_req: &RegisterRequest, auth_req: &AuthenticateRequest, auth_rsp: &AuthenticateResponse) -> Vec<u8> {
    let mut data = Vec::with_capacity(U2F_AUTH_MAX_DATA_TBS_SIZE);
    data.extend_from_slice(&reg_req.application);
    data.push(auth_rsp.user_presence);
    data.extend_from_slice(&auth_rsp.counter.to_be_bytes());
    data.extend_from_slice(&auth_req.challenge);
    data
}

fn verify_p256(public_key: &[u8], message: &[u8], der_signature: &[u8]) -> Result<(), Error> {
    if public_key.len() != U2F_EC_POINT_SIZE || public_key[0] != U2F_POINT_UNCOMPRESSED {
        return Err(CryptoMismatch::InvalidPublicKey.into());
    }

    // Structural check first so a garbled encoding is not reported as a bad signature.
    let (r, s) = asn1::decode_signature(der_signature)?;
    trace!("r: {}", to_hex(&r));
    trace!("s: {}", to_hex(&s));
    trace!("digest: {}", to_hex(&Sha256::digest(message)));

    let public_key = signature::UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_ASN1, public_key);
    public_key
        .verify(message, der_signature)
        .map_err(|_| CryptoMismatch::Signature.into())
}

pub fn check_registration(req: &RegisterRequest, rsp: &RegisterResponse) -> Result<(), Error> {
    if rsp.register_id != U2F_REGISTER_ID {
        return Err(CryptoMismatch::RegisterId(rsp.register_id).into());
    }

    if rsp.point_format() != U2F_POINT_UNCOMPRESSED {
        return Err(CryptoMismatch::PointFormat(rsp.point_format()).into());
    }

    let cert = asn1::extract_certificate(rsp)?;
    let attestation_key = asn1::extract_subject_public_key(cert)?;
    let sig = asn1::extract_attestation_signature(rsp)?;

    debug!("attestation cert: {}", to_hex(cert));
    debug!("attestation public key: {}", to_hex(&attestation_key));
    debug!("attestation signature: {}", to_hex(sig));

    let data = registration_signed_data(req, rsp)?;
    verify_p256(&attestation_key, &data, sig)
}

/// Checks the attestation signature of a REGISTER response against the certificate's key.
pub fn verify_registration(req: &RegisterRequest, rsp: &RegisterResponse) -> bool {
    report("registration", check_registration(req, rsp))
}

/// `response_len` is the AUTHENTICATE response body length; the signature is its last `response_len - 5` bytes.
pub fn check_signature(
    reg_req: &RegisterRequest,
    reg_rsp: &RegisterResponse,
    auth_req: &AuthenticateRequest,
    auth_rsp: &AuthenticateResponse,
    response_len: usize,
) -> Result<(), Error> {
    if auth_rsp.user_presence & U2F_AUTH_FLAG_TUP == 0 {
        return Err(CryptoMismatch::UserPresence(auth_rsp.user_presence).into());
    }

    let sig_len = response_len
        .checked_sub(AuthenticateResponse::HEADER_LEN)
        .ok_or(MalformedResponse::ShortResponse {
            expected: AuthenticateResponse::HEADER_LEN,
            actual: response_len,
        })?;

    let sig = auth_rsp.signature.get(..sig_len).ok_or(MalformedResponse::Truncated {
        needed: sig_len,
        available: auth_rsp.signature.len(),
    })?;

    debug!("authentication signature: {}", to_hex(sig));

    let data = authentication_signed_data(reg_req, auth_req, auth_rsp);
    verify_p256(&reg_rsp.user_public_key, &data, sig)
}

/// Checks an AUTHENTICATE signature against the public key returned at registration.
pub fn verify_signature(
    reg_req: &RegisterRequest,
    reg_rsp: &RegisterResponse,
    auth_req: &AuthenticateRequest,
    auth_rsp: &AuthenticateResponse,
    response_len: usize,
) -> bool {
    report("authentication", check_signature(reg_req, reg_rsp, auth_req, auth_rsp, response_len))
}

fn report(what: &str, res: Result<(), Error>) -> bool {
    match res {
        Ok(()) => true,
        Err(e) if e.is_structural() => {
            warn!("{} precheck failed: {}", what, e);
            false
        }
        Err(e) => {
            warn!("{} signature failed: {}", what, e);
            false
        }
    }
}

/// Whether the certificate signature verifies with the certificate's own subject key.
pub fn is_self_signed(cert: &[u8]) -> Result<bool, Error> {
    let tbs = asn1::extract_tbs_certificate(cert)?;
    let sig = asn1::extract_cert_signature(cert)?;
    let key = asn1::extract_subject_public_key(cert)?;

    match verify_p256(&key, tbs, sig) {
        Ok(()) => Ok(true),
        Err(Error::CryptoMismatch(CryptoMismatch::Signature)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// One line summary of the attestation certificate.
pub fn describe_certificate(cert: &[u8]) -> Result<String, Error> {
    let (_, x509) = x509_parser::parse_x509_certificate(cert).map_err(|e| MalformedResponse::MalformedCertificate(e.to_string()))?;

    Ok(format!(
        "subject: {}, issuer: {}, valid from {} to {}",
        x509.subject(),
        x509.issuer(),
        x509.validity().not_before,
        x509.validity().not_after
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> (RegisterRequest, RegisterResponse) {
        let req = RegisterRequest {
            challenge: [0x11; U2F_CHAL_SIZE],
            application: [0x22; U2F_APPID_SIZE],
        };
        let mut user_public_key = [0x33; U2F_EC_POINT_SIZE];
        user_public_key[0] = U2F_POINT_UNCOMPRESSED;

        let rsp = RegisterResponse {
            register_id: U2F_REGISTER_ID,
            user_public_key,
            key_handle_len: 32,
            key_handle_cert_sig: vec![0x44; 40],
        };
        (req, rsp)
    }

    #[test]
    fn registration_signed_data_layout() {
        let (req, rsp) = registration();
        let data = registration_signed_data(&req, &rsp).unwrap();

        assert_eq!(data.len(), 1 + 32 + 32 + 32 + 65);
        assert_eq!(data[0], U2F_REGISTER_HASH_ID);
        assert_eq!(&data[1..33], &[0x22; 32]);
        assert_eq!(&data[33..65], &[0x11; 32]);
        assert_eq!(&data[65..97], &[0x44; 32]);
        assert_eq!(&data[97..], &rsp.user_public_key[..]);
    }

    #[test]
    fn authentication_signed_data_layout() {
        let (reg_req, reg_rsp) = registration();
        let auth_req = AuthenticateRequest::for_registration(U2F_AUTH_ENFORCE, [0x55; U2F_CHAL_SIZE], &reg_req, &reg_rsp).unwrap();
        let auth_rsp = AuthenticateResponse {
            user_presence: U2F_AUTH_FLAG_TUP,
            counter: 0x01020304,
            signature: vec![],
        };

        let data = authentication_signed_data(&reg_req, &auth_req, &auth_rsp);
        assert_eq!(data.len(), U2F_AUTH_MAX_DATA_TBS_SIZE);
        assert_eq!(&data[..32], &[0x22; 32]);
        assert_eq!(&data[32..37], &[0x01, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&data[37..], &[0x55; 32]);
    }

    #[test]
    fn garbled_signature_is_structural() {
        let mut key = [0x33; U2F_EC_POINT_SIZE];
        key[0] = U2F_POINT_UNCOMPRESSED;

        let err = verify_p256(&key, b"message", &[0x30, 0x03, 0x02, 0x01]).unwrap_err();
        assert!(err.is_structural());

        let err = verify_p256(&key[1..], b"message", &[]).unwrap_err();
        assert!(matches!(err, Error::CryptoMismatch(CryptoMismatch::InvalidPublicKey)));
    }

    #[test]
    fn unsupported_certificate_is_reported() {
        assert!(describe_certificate(&[0x30, 0x03, 0x02, 0x01, 0x01]).is_err());
        assert!(is_self_signed(&[0x30, 0x00]).is_err());
    }
}
