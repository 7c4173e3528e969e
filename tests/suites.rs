use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use u2f_compliance::u2f::client::token::{MemoryKeyStore, SoftToken};
use u2f_compliance::u2f::client::{ComplianceSuite, FailurePolicy, SuiteConfig, Unattended};
use u2f_compliance::u2f::error::Error;
use u2f_compliance::u2f::hid_proto::{HidTransport, VirtualHidToken};
use u2f_compliance::u2f::proto::constants::*;
use u2f_compliance::u2f::proto::raw_message::AuthenticateRequest;
use u2f_compliance::u2f::transport::{ApduMode, ApduTransport, RawTransport, TransportConfig};

fn no_button() -> SuiteConfig {
    SuiteConfig {
        has_button: false,
        ..SuiteConfig::default()
    }
}

#[test]
fn nfc_suite_passes_against_soft_token() {
    let transport = ApduTransport::open(SoftToken::simple().unwrap(), TransportConfig::default()).unwrap();
    let mut suite = ComplianceSuite::new(transport, no_button(), Unattended);

    suite.run_nfc().unwrap();

    let report = suite.into_report();
    assert!(report.is_success(), "{:?}", report.failed);
    assert_eq!(report.passed, 16);
}

#[test]
fn hid_suite_passes_without_button() {
    let hid = HidTransport::new(VirtualHidToken::new(SoftToken::simple().unwrap()));
    let transport = ApduTransport::open(hid, TransportConfig::default()).unwrap();
    let mut suite = ComplianceSuite::new(transport, no_button(), Unattended);

    suite.run_hid().unwrap();

    let report = suite.into_report();
    assert!(report.is_success(), "{:?}", report.failed);
}

#[test]
fn hid_suite_passes_with_button() {
    let touched = Rc::new(Cell::new(false));

    let button = touched.clone();
    let token = SoftToken::new(MemoryKeyStore::default(), move |_: Duration| button.replace(false)).unwrap();

    let finger = touched.clone();
    let operator = move |_: &str| finger.set(true);

    let hid = HidTransport::new(VirtualHidToken::new(token));
    let transport = ApduTransport::open(hid, TransportConfig::default()).unwrap();
    let mut suite = ComplianceSuite::new(transport, SuiteConfig::default(), operator);

    suite.run_hid().unwrap();

    let report = suite.into_report();
    assert!(report.is_success(), "{:?}", report.failed);
}

/// Answers every command with the same status word.
struct Stubborn(u16);

impl RawTransport for Stubborn {
    fn transmit(&mut self, _capdu: &[u8], _max_response: usize) -> Result<Vec<u8>, Error> {
        Ok(self.0.to_be_bytes().to_vec())
    }
}

#[test]
fn abort_policy_stops_at_first_failure() {
    let transport = ApduTransport::open(Stubborn(U2F_SW_FILE_NOT_FOUND), TransportConfig::default()).unwrap();
    let mut suite = ComplianceSuite::new(transport, no_button(), Unattended);

    match suite.run_nfc() {
        Err(Error::Aborted(name)) => assert_eq!(name, "Applet Select - Check Version Response"),
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }

    let report = suite.into_report();
    assert_eq!(report.passed, 0);
    assert_eq!(report.failed.len(), 1);
}

#[test]
fn continue_policy_records_every_failure() {
    let config = SuiteConfig {
        failure_policy: FailurePolicy::Continue,
        ..no_button()
    };
    let transport = ApduTransport::open(Stubborn(U2F_SW_INS_NOT_SUPPORTED), TransportConfig::default()).unwrap();
    let mut suite = ComplianceSuite::new(transport, config, Unattended);

    suite.run_nfc().unwrap();

    let report = suite.into_report();
    // Only the unknown INS check expects 6D00.
    assert_eq!(report.passed, 1);
    assert_eq!(report.failed.len(), 15);
}

#[test]
fn counter_increments_by_one() {
    let transport = ApduTransport::open(SoftToken::simple().unwrap(), TransportConfig::default()).unwrap();
    let mut suite = ComplianceSuite::new(transport, no_button(), Unattended);

    suite.enroll(ApduMode::Extended, U2F_SW_NO_ERROR).unwrap();
    let first = suite.sign(ApduMode::Short, U2F_SW_NO_ERROR, false).unwrap().unwrap();
    let second = suite.sign(ApduMode::Extended, U2F_SW_NO_ERROR, false).unwrap().unwrap();

    assert_eq!(second, first + 1);
    assert_eq!(suite.enrollment().unwrap().last_counter, Some(second));
    assert_eq!(suite.transport().raw().counter(), second);
}

#[test]
fn skipped_counter_fails_once_then_resyncs() {
    let transport = ApduTransport::open(SoftToken::simple().unwrap(), TransportConfig::default()).unwrap();
    let mut suite = ComplianceSuite::new(transport, no_button(), Unattended);

    suite.enroll(ApduMode::Extended, U2F_SW_NO_ERROR).unwrap();
    let first = suite.sign(ApduMode::Extended, U2F_SW_NO_ERROR, false).unwrap().unwrap();

    // A signature the suite never sees moves the token counter ahead.
    let enrollment = suite.enrollment().unwrap().clone();
    let req = AuthenticateRequest::for_registration(U2F_AUTH_ENFORCE, [0x11; U2F_CHAL_SIZE], &enrollment.request, &enrollment.response).unwrap();
    let (_, sw) = suite
        .transport()
        .exchange(ApduMode::Extended, ISO_CLA, U2F_AUTHENTICATE, U2F_AUTH_ENFORCE, 0x00, &req.payload().unwrap(), U2F_AUTH_RSP_MAX_SIZE)
        .unwrap();
    assert_eq!(sw, U2F_SW_NO_ERROR);

    assert!(suite.sign(ApduMode::Extended, U2F_SW_NO_ERROR, false).is_err());
    assert_eq!(suite.enrollment().unwrap().last_counter, Some(first + 2));

    let next = suite.sign(ApduMode::Extended, U2F_SW_NO_ERROR, false).unwrap().unwrap();
    assert_eq!(next, first + 3);
    assert_eq!(suite.enrollment().unwrap().last_counter, Some(next));
}

#[test]
fn nfc_suite_restores_configured_block_size() {
    let config = TransportConfig {
        block_size: 128,
        ..TransportConfig::default()
    };
    let transport = ApduTransport::open(SoftToken::simple().unwrap(), config).unwrap();
    let mut suite = ComplianceSuite::new(transport, no_button(), Unattended);

    suite.run_nfc().unwrap();

    assert_eq!(suite.transport().block_size(), 128);
    assert!(suite.report().is_success());
}

#[test]
fn tampered_requests_are_refused() {
    let transport = ApduTransport::open(SoftToken::simple().unwrap(), TransportConfig::default()).unwrap();
    let mut suite = ComplianceSuite::new(transport, no_button(), Unattended);

    suite.enroll(ApduMode::Short, U2F_SW_NO_ERROR).unwrap();
    suite.sign_with_wrong_key_handle(ApduMode::Short).unwrap();
    suite.sign_with_wrong_app_id(ApduMode::Extended).unwrap();

    // The stored enrollment is left intact.
    suite.sign(ApduMode::Short, U2F_SW_NO_ERROR, false).unwrap();
}

#[test]
fn check_only_never_signs() {
    let transport = ApduTransport::open(SoftToken::simple().unwrap(), TransportConfig::default()).unwrap();
    let mut suite = ComplianceSuite::new(transport, no_button(), Unattended);

    suite.enroll(ApduMode::Extended, U2F_SW_NO_ERROR).unwrap();
    assert_eq!(suite.sign(ApduMode::Extended, U2F_SW_CONDITIONS_NOT_SATISFIED, true).unwrap(), None);
    assert!(suite.sign(ApduMode::Extended, U2F_SW_NO_ERROR, true).is_err());
}

#[test]
fn sign_before_enroll_fails() {
    let transport = ApduTransport::open(SoftToken::simple().unwrap(), TransportConfig::default()).unwrap();
    let mut suite = ComplianceSuite::new(transport, no_button(), Unattended);

    assert!(suite.sign(ApduMode::Short, U2F_SW_NO_ERROR, false).is_err());
}

#[test]
fn legacy_version_form_is_accepted() {
    let transport = ApduTransport::open(SoftToken::simple().unwrap(), TransportConfig::default()).unwrap();
    let mut suite = ComplianceSuite::new(transport, no_button(), Unattended);

    suite.version().unwrap();
    suite.select_applet().unwrap();
}
