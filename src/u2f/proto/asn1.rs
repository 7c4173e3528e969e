//! Pulls the attestation certificate and the DER signatures out of a REGISTER response.
//!
//! This is not a general ASN.1 parser. Only the constructs a U2F token emits are understood, and
//! every function fails closed on anything else.

use untrusted::{Input, Reader};

use crate::u2f::error::{Error, MalformedResponse};
use crate::u2f::proto::constants::*;
use crate::u2f::proto::raw_message::RegisterResponse;

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn cert_err(msg: impl Into<String>) -> Error {
    MalformedResponse::MalformedCertificate(msg.into()).into()
}

fn sig_err(msg: impl Into<String>) -> Error {
    MalformedResponse::MalformedSignature(msg.into()).into()
}

/// Returns `(header_len, content_len)` of the certificate SEQUENCE at the start of `bytes`.
fn certificate_header(bytes: &[u8]) -> Result<(usize, usize), Error> {
    if bytes.len() < 4 {
        return Err(MalformedResponse::Truncated {
            needed: 4,
            available: bytes.len(),
        }
        .into());
    }

    if bytes[0] != ASN1_SEQ_TYPE {
        return Err(cert_err(format!("expected SEQUENCE tag, got 0x{:02x}", bytes[0])));
    }

    match bytes[1] {
        ASN1_LEN_ONE_BYTE => Ok((3, bytes[2] as usize)),
        ASN1_LEN_TWO_BYTES => Ok((4, (bytes[2] as usize) << 8 | bytes[3] as usize)),
        other => Err(cert_err(format!("unsupported length form 0x{:02x}", other))),
    }
}

/// The attestation certificate, located right after the key handle.
pub fn extract_certificate(rsp: &RegisterResponse) -> Result<&[u8], Error> {
    let offset = rsp.key_handle()?.len();
    let region = &rsp.key_handle_cert_sig[offset..];

    let (header_len, seq_len) = certificate_header(region)?;
    let total = header_len + seq_len;
    if total > region.len() {
        return Err(MalformedResponse::Truncated {
            needed: total,
            available: region.len(),
        }
        .into());
    }

    Ok(&region[..total])
}

/// The DER attestation signature following the certificate.
pub fn extract_attestation_signature(rsp: &RegisterResponse) -> Result<&[u8], Error> {
    let offset = rsp.key_handle_len as usize + extract_certificate(rsp)?.len();
    let region = &rsp.key_handle_cert_sig[offset..];

    if region.len() < 2 {
        return Err(MalformedResponse::Truncated {
            needed: 2,
            available: region.len(),
        }
        .into());
    }

    if region[0] != ASN1_SEQ_TYPE {
        return Err(sig_err(format!("expected SEQUENCE tag, got 0x{:02x}", region[0])));
    }

    if region[1] & ASN1_DEFINITE_SHORT_MASK != 0 {
        return Err(sig_err(format!("long form length 0x{:02x}", region[1])));
    }

    let total = 2 + region[1] as usize;
    if total > region.len() {
        return Err(MalformedResponse::Truncated {
            needed: total,
            available: region.len(),
        }
        .into());
    }

    Ok(&region[..total])
}

/// The uncompressed P-256 point following the SubjectPublicKeyInfo lead-in.
pub fn extract_subject_public_key(cert: &[u8]) -> Result<[u8; U2F_EC_POINT_SIZE], Error> {
    let start = find(cert, &ASN1_P256_SPKI_PREFIX).ok_or(MalformedResponse::KeyNotFound)? + ASN1_P256_SPKI_PREFIX.len();

    let point = cert.get(start..start + U2F_EC_POINT_SIZE).ok_or(MalformedResponse::Truncated {
        needed: U2F_EC_POINT_SIZE,
        available: cert.len() - start,
    })?;

    let mut key = [0u8; U2F_EC_POINT_SIZE];
    key.copy_from_slice(point);
    Ok(key)
}

/// The signature value closing the certificate.
///
/// The BIT STRING must span exactly to the end of the certificate; anything else is treated as
/// corruption.
pub fn extract_cert_signature(cert: &[u8]) -> Result<&[u8], Error> {
    let off = find(cert, &ASN1_ECDSA_SHA256_SIG_PREFIX).ok_or(MalformedResponse::SignatureNotFound)? + ASN1_ECDSA_SHA256_SIG_PREFIX.len();

    let remaining = cert.len() - off;
    if remaining < 2 {
        return Err(MalformedResponse::Truncated {
            needed: 2,
            available: remaining,
        }
        .into());
    }

    let declared = cert[off] as usize;
    if declared != remaining - 1 {
        return Err(MalformedResponse::LengthMismatch {
            declared,
            actual: remaining - 1,
        }
        .into());
    }

    if cert[off + 1] != 0x00 {
        return Err(sig_err(format!("{} unused bits in signature BIT STRING", cert[off + 1])));
    }

    Ok(&cert[off + 2..])
}

/// The `tbsCertificate` element, first child of the certificate SEQUENCE.
pub fn extract_tbs_certificate(cert: &[u8]) -> Result<&[u8], Error> {
    let (header_len, _) = certificate_header(cert)?;
    let inner = &cert[header_len..];

    let (tbs_header, tbs_len) = certificate_header(inner)?;
    inner
        .get(..tbs_header + tbs_len)
        .ok_or_else(|| cert_err("tbsCertificate overruns certificate"))
}

fn read_integer(reader: &mut Reader) -> Result<[u8; U2F_EC_KEY_SIZE], Error> {
    let tag = reader.read_byte().map_err(|_| MalformedResponse::InvalidInteger)?;
    if tag != ASN1_INTEGER_TYPE {
        return Err(MalformedResponse::InvalidInteger.into());
    }

    let len = reader.read_byte().map_err(|_| MalformedResponse::InvalidInteger)? as usize;
    if len & ASN1_DEFINITE_SHORT_MASK as usize != 0 || len == 0 {
        return Err(MalformedResponse::InvalidInteger.into());
    }

    let value = reader.read_bytes(len).map_err(|_| MalformedResponse::InvalidInteger)?;
    let value = value.as_slice_less_safe();

    let first_non_zero = value.iter().position(|b| *b != 0).unwrap_or(value.len());
    let digits = &value[first_non_zero..];
    if digits.len() > U2F_EC_KEY_SIZE {
        return Err(MalformedResponse::InvalidInteger.into());
    }

    let mut out = [0u8; U2F_EC_KEY_SIZE];
    out[U2F_EC_KEY_SIZE - digits.len()..].copy_from_slice(digits);
    Ok(out)
}

/// Decodes `SEQUENCE { INTEGER r, INTEGER s }` into two 32 byte big-endian scalars.
pub fn decode_signature(der: &[u8]) -> Result<([u8; U2F_EC_KEY_SIZE], [u8; U2F_EC_KEY_SIZE]), Error> {
    if der.len() < 2 || der[0] != ASN1_SEQ_TYPE {
        return Err(sig_err("expected SEQUENCE"));
    }

    let seq_len = der[1] as usize;
    if der[1] & ASN1_DEFINITE_SHORT_MASK != 0 || seq_len != der.len() - 2 {
        return Err(MalformedResponse::LengthMismatch {
            declared: seq_len,
            actual: der.len() - 2,
        }
        .into());
    }

    Input::from(&der[2..]).read_all(Error::MalformedResponse(MalformedResponse::InvalidInteger), |reader| {
        let r = read_integer(reader)?;
        let s = read_integer(reader)?;
        Ok((r, s))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(cert: &[u8], sig: &[u8]) -> RegisterResponse {
        let mut region = vec![0xab; 64];
        region.extend_from_slice(cert);
        region.extend_from_slice(sig);

        RegisterResponse {
            register_id: U2F_REGISTER_ID,
            user_public_key: [0x04; U2F_EC_POINT_SIZE],
            key_handle_len: 64,
            key_handle_cert_sig: region,
        }
    }

    fn fake_cert(point: &[u8; 65]) -> Vec<u8> {
        let mut content = vec![0x02, 0x01, 0x01];
        content.extend_from_slice(&ASN1_P256_SPKI_PREFIX);
        content.extend_from_slice(point);
        content.extend_from_slice(&ASN1_ECDSA_SHA256_SIG_PREFIX);
        content.extend_from_slice(&[0x03, 0x00, 0x30, 0x00]);

        let mut cert = vec![ASN1_SEQ_TYPE, ASN1_LEN_ONE_BYTE, content.len() as u8];
        cert.extend_from_slice(&content);
        cert
    }

    #[test]
    fn certificate_and_signature_boundaries() {
        let mut point = [0u8; 65];
        point[0] = 0x04;
        point[1..].iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);

        let cert = fake_cert(&point);
        let sig = [0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x02];
        let rsp = fixture(&cert, &sig);

        assert_eq!(extract_certificate(&rsp).unwrap(), &cert[..]);
        assert_eq!(extract_attestation_signature(&rsp).unwrap(), &sig[..]);
        assert_eq!(extract_subject_public_key(&cert).unwrap(), point);
        assert_eq!(extract_cert_signature(&cert).unwrap(), &[0x30, 0x00]);
    }

    #[test]
    fn certificate_requires_sequence_and_long_length() {
        let rsp = fixture(&[0x31, 0x81, 0x01, 0x00], &[]);
        assert!(matches!(extract_certificate(&rsp), Err(Error::MalformedResponse(MalformedResponse::MalformedCertificate(_)))));

        let rsp = fixture(&[0x30, 0x05, 0x01, 0x02, 0x03, 0x04, 0x05], &[]);
        assert!(matches!(extract_certificate(&rsp), Err(Error::MalformedResponse(MalformedResponse::MalformedCertificate(_)))));

        let rsp = fixture(&[0x30, 0x82, 0x10, 0x00, 0x00], &[]);
        assert!(matches!(extract_certificate(&rsp), Err(Error::MalformedResponse(MalformedResponse::Truncated { .. }))));
    }

    #[test]
    fn key_and_signature_not_found() {
        assert!(matches!(
            extract_subject_public_key(&[0x30, 0x81, 0x00]),
            Err(Error::MalformedResponse(MalformedResponse::KeyNotFound))
        ));
        assert!(matches!(
            extract_cert_signature(&[0x30, 0x81, 0x00]),
            Err(Error::MalformedResponse(MalformedResponse::SignatureNotFound))
        ));

        let mut short = ASN1_P256_SPKI_PREFIX.to_vec();
        short.extend_from_slice(&[0x04; 10]);
        assert!(matches!(
            extract_subject_public_key(&short),
            Err(Error::MalformedResponse(MalformedResponse::Truncated { .. }))
        ));
    }

    #[test]
    fn cert_signature_length_must_match_exactly() {
        let mut cert = ASN1_ECDSA_SHA256_SIG_PREFIX.to_vec();
        cert.extend_from_slice(&[0x05, 0x00, 0x30, 0x00]);
        assert!(matches!(
            extract_cert_signature(&cert),
            Err(Error::MalformedResponse(MalformedResponse::LengthMismatch { declared: 5, actual: 3 }))
        ));

        let mut cert = ASN1_ECDSA_SHA256_SIG_PREFIX.to_vec();
        cert.extend_from_slice(&[0x03, 0x01, 0x30, 0x00]);
        assert!(extract_cert_signature(&cert).is_err());
    }

    #[test]
    fn decode_signature_strips_and_pads() {
        let mut der = vec![0x30, 0x00, 0x02, 0x21, 0x00];
        der.extend_from_slice(&[0xff; 32]);
        der.extend_from_slice(&[0x02, 0x02, 0x01, 0x02]);
        der[1] = (der.len() - 2) as u8;

        let (r, s) = decode_signature(&der).unwrap();
        assert_eq!(r, [0xff; 32]);
        let mut expected_s = [0u8; 32];
        expected_s[30] = 0x01;
        expected_s[31] = 0x02;
        assert_eq!(s, expected_s);
    }

    #[test]
    fn decode_signature_rejects_garbage() {
        assert!(decode_signature(&[]).is_err());
        assert!(decode_signature(&[0x30, 0x03, 0x02, 0x01, 0x01]).is_err());
        assert!(decode_signature(&[0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01, 0x00]).is_err());
        let mut too_long = vec![0x30, 0x26, 0x02, 0x21];
        too_long.extend_from_slice(&[0x01; 33]);
        too_long.extend_from_slice(&[0x02, 0x01, 0x01]);
        assert!(decode_signature(&too_long).is_err());
    }
}
