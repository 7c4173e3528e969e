#![no_main]
#[macro_use] extern crate libfuzzer_sys;
extern crate u2f_compliance;

use u2f_compliance::u2f::proto::asn1;
use u2f_compliance::u2f::proto::raw_message::{Message, AuthenticateRequest, AuthenticateResponse, RegisterRequest,
    RegisterResponse, VersionRequest, VersionResponse};
use u2f_compliance::u2f::proto::raw_message::apdu::{ApduFrame, Request, Response};

fuzz_target!(|data: &[u8]| {
    if let Ok(req) = Request::read_from(data) {
        let _ = AuthenticateRequest::from_apdu(req.clone());
        let _ = RegisterRequest::from_apdu(req.clone());
        let _ = VersionRequest::from_apdu(req);
    };

    if let Ok(rsp) = Response::read_from(data) {
        let _ = AuthenticateResponse::from_apdu(rsp.clone());
        let _ = VersionResponse::from_apdu(rsp.clone());

        if let Ok(reg) = RegisterResponse::from_apdu(rsp) {
            if let Ok(cert) = asn1::extract_certificate(&reg) {
                let _ = asn1::extract_subject_public_key(cert);
                let _ = asn1::extract_cert_signature(cert);
            }
            let _ = asn1::extract_attestation_signature(&reg);
        }
    };

    let _ = asn1::decode_signature(data);
});
