//! Compliance test sequences for U2F tokens over NFC and USB HID.

pub mod token;

use std::io::BufRead;

use ring::rand::{SecureRandom, SystemRandom};
use serde_derive::Deserialize;
use tracing::{error, info, warn};

use crate::u2f::error::Error;
use crate::u2f::hid_proto::{HidDevice, HidTransport};
use crate::u2f::proto::asn1;
use crate::u2f::proto::constants::*;
use crate::u2f::proto::raw_message::{AuthenticateRequest, AuthenticateResponse, RegisterRequest, RegisterResponse};
use crate::u2f::transport::{ApduMode, ApduTransport, RawTransport};
use crate::u2f::verifier;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    Abort,
    Continue,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    pub failure_policy: FailurePolicy,
    /// Wait for the operator after each failed check.
    pub pause: bool,
    /// The token needs a touch for every user presence test.
    pub has_button: bool,
    pub log_crypto: bool,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        SuiteConfig {
            failure_policy: FailurePolicy::Abort,
            pause: false,
            has_button: true,
            log_crypto: false,
        }
    }
}

/// Whoever stands in front of the token.
pub trait Operator {
    fn prompt(&mut self, message: &str);
}

impl<F: FnMut(&str)> Operator for F {
    fn prompt(&mut self, message: &str) {
        self(message)
    }
}

/// Prompts on the log and waits for enter on stdin.
pub struct ConsoleOperator;

impl Operator for ConsoleOperator {
    fn prompt(&mut self, message: &str) {
        info!("{}", message);
        let mut line = String::new();
        if let Err(e) = std::io::stdin().lock().read_line(&mut line) {
            warn!("unable to read from stdin: {}", e);
        }
    }
}

/// Never waits.
pub struct Unattended;

impl Operator for Unattended {
    fn prompt(&mut self, _message: &str) {}
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SuiteReport {
    pub passed: usize,
    pub failed: Vec<String>,
    pub latency_violations: usize,
}

impl SuiteReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The key registered by the last successful enrollment.
#[derive(Clone, Debug)]
pub struct Enrollment {
    pub request: RegisterRequest,
    pub response: RegisterResponse,
    pub last_counter: Option<u32>,
}

pub struct ComplianceSuite<T: RawTransport> {
    transport: ApduTransport<T>,
    config: SuiteConfig,
    operator: Box<dyn Operator>,
    report: SuiteReport,
    enrollment: Option<Enrollment>,
    rng: SystemRandom,
}

fn expect_status(expected: u16, actual: u16) -> Result<(), Error> {
    if expected != actual {
        return Err(Error::Other(format!("expected status 0x{:04X}, got 0x{:04X}", expected, actual)));
    }
    Ok(())
}

fn expect_empty(body: &[u8]) -> Result<(), Error> {
    if !body.is_empty() {
        return Err(Error::Other(format!("expected an empty body, got {} bytes", body.len())));
    }
    Ok(())
}

impl<T: RawTransport> ComplianceSuite<T> {
    pub fn new(transport: ApduTransport<T>, config: SuiteConfig, operator: impl Operator + 'static) -> Self {
        ComplianceSuite {
            transport,
            config,
            operator: Box::new(operator),
            report: SuiteReport::default(),
            enrollment: None,
            rng: SystemRandom::new(),
        }
    }

    pub fn transport(&mut self) -> &mut ApduTransport<T> {
        &mut self.transport
    }

    pub fn enrollment(&self) -> Option<&Enrollment> {
        self.enrollment.as_ref()
    }

    pub fn report(&self) -> SuiteReport {
        SuiteReport {
            latency_violations: self.transport.latency_violations(),
            ..self.report.clone()
        }
    }

    pub fn into_report(self) -> SuiteReport {
        self.report()
    }

    /// Records the outcome of one check and applies the failure policy.
    pub fn check<R>(&mut self, name: &str, res: Result<R, Error>) -> Result<Option<R>, Error> {
        match res {
            Ok(r) => {
                self.report.passed += 1;
                info!("PASS {}", name);
                Ok(Some(r))
            }
            Err(e) => {
                error!("FAIL {}: {}", name, e);
                self.report.failed.push(format!("{}: {}", name, e));

                if self.config.pause {
                    self.operator.prompt("Hit enter to continue..");
                }

                match self.config.failure_policy {
                    FailurePolicy::Abort => Err(Error::Aborted(name.to_string())),
                    FailurePolicy::Continue => {
                        warn!("(continuing)");
                        Ok(None)
                    }
                }
            }
        }
    }

    fn random_bytes(&self) -> Result<[u8; 32], Error> {
        let mut buf = [0u8; 32];
        self.rng.fill(&mut buf)?;
        Ok(buf)
    }

    pub fn select_applet(&mut self) -> Result<(), Error> {
        let (body, sw) = self.transport.exchange(
            ApduMode::Short,
            ISO_CLA,
            ISO_INS_SELECT,
            ISO_SELECT_BY_AID,
            0x00,
            &U2F_APPLET_AID,
            U2F_V2_VERSION_STR.len(),
        )?;
        expect_status(U2F_SW_NO_ERROR, sw)?;

        if body != U2F_V2_VERSION_STR.as_bytes() {
            return Err(Error::Other(format!("unexpected version {:?}", String::from_utf8_lossy(&body))));
        }
        Ok(())
    }

    /// VERSION in ISO form, then in the legacy `Lc = 0000` form older tokens expect.
    pub fn version(&mut self) -> Result<(), Error> {
        let iso = [ISO_CLA, U2F_VERSION, 0x00, 0x00, 0x00, 0x00, 0x00];
        let (mut body, mut sw) = self.transport.transmit_raw(&iso, MAX_RESPONSE_LEN_SHORT)?;

        if sw != U2F_SW_NO_ERROR {
            info!("ISO VERSION rejected with 0x{:04X}, retrying with Lc", sw);
            let legacy = self
                .transport
                .exchange(ApduMode::Extended, ISO_CLA, U2F_VERSION, 0x00, 0x00, &[], MAX_RESPONSE_LEN_EXTENDED)?;
            body = legacy.0;
            sw = legacy.1;
        }

        expect_status(U2F_SW_NO_ERROR, sw)?;
        if body != U2F_V2_VERSION_STR.as_bytes() {
            return Err(Error::Other(format!("unexpected version {:?}", String::from_utf8_lossy(&body))));
        }
        Ok(())
    }

    /// Sends a command that must be rejected with `expected` and no data.
    pub fn expect_rejection(&mut self, mode: ApduMode, cla: u8, ins: u8, payload: &[u8], expected: u16) -> Result<(), Error> {
        let (body, sw) = self.transport.exchange(mode, cla, ins, 0x00, 0x00, payload, mode.max_response_len())?;
        expect_status(expected, sw)?;
        expect_empty(&body)
    }

    /// Registers a fresh random application and checks the attestation.
    pub fn enroll(&mut self, mode: ApduMode, expected: u16) -> Result<(), Error> {
        let request = RegisterRequest {
            challenge: self.random_bytes()?,
            application: self.random_bytes()?,
        };

        let (body, sw) = self.transport.exchange(
            mode,
            ISO_CLA,
            U2F_REGISTER,
            U2F_AUTH_ENFORCE,
            0x00,
            &request.payload(),
            U2F_REGISTER_RSP_MAX_SIZE,
        )?;
        expect_status(expected, sw)?;

        if expected != U2F_SW_NO_ERROR {
            return expect_empty(&body);
        }

        let response = RegisterResponse::from_bytes(&body)?;
        info!("enroll: {} bytes", body.len());

        verifier::check_registration(&request, &response)?;
        self.describe_attestation(&response);

        self.enrollment = Some(Enrollment {
            request,
            response,
            last_counter: None,
        });
        Ok(())
    }

    fn describe_attestation(&self, response: &RegisterResponse) {
        let cert = match asn1::extract_certificate(response) {
            Ok(cert) => cert,
            Err(_) => return,
        };

        match verifier::is_self_signed(cert) {
            Ok(true) => info!("attestation certificate is self-signed"),
            Ok(false) => info!("attestation certificate is CA-signed or signed by an unknown key"),
            Err(e) => warn!("attestation certificate signature not checked: {}", e),
        }

        if self.config.log_crypto {
            match verifier::describe_certificate(cert) {
                Ok(desc) => info!("attestation certificate {}", desc),
                Err(e) => warn!("unable to parse attestation certificate: {}", e),
            }
        }
    }

    fn enrolled(&self) -> Result<&Enrollment, Error> {
        self.enrollment.as_ref().ok_or_else(|| Error::Other("no enrollment to sign with".to_string()))
    }

    /// Authenticates with the last enrollment. Returns the counter on success.
    pub fn sign(&mut self, mode: ApduMode, expected: u16, check_only: bool) -> Result<Option<u32>, Error> {
        let enrollment = self.enrolled()?.clone();
        self.sign_with(mode, expected, check_only, &enrollment.request, &enrollment.response)
    }

    fn sign_with(
        &mut self,
        mode: ApduMode,
        expected: u16,
        check_only: bool,
        reg_req: &RegisterRequest,
        reg_rsp: &RegisterResponse,
    ) -> Result<Option<u32>, Error> {
        let control = if check_only { U2F_AUTH_CHECK_ONLY } else { U2F_AUTH_ENFORCE };
        let auth_req = AuthenticateRequest::for_registration(control, self.random_bytes()?, reg_req, reg_rsp)?;

        let (body, sw) = self.transport.exchange(
            mode,
            ISO_CLA,
            U2F_AUTHENTICATE,
            control,
            0x00,
            &auth_req.payload()?,
            U2F_AUTH_RSP_MAX_SIZE,
        )?;
        expect_status(expected, sw)?;

        if expected != U2F_SW_NO_ERROR {
            expect_empty(&body)?;
            return Ok(None);
        }

        let auth_rsp = AuthenticateResponse::from_bytes(&body)?;
        info!("sign: {} bytes, counter {}", body.len(), auth_rsp.counter);

        verifier::check_signature(reg_req, reg_rsp, &auth_req, &auth_rsp, body.len())?;

        if let Some(enrollment) = self.enrollment.as_mut() {
            if let Some(last) = enrollment.last_counter {
                if auth_rsp.counter != last.wrapping_add(1) {
                    enrollment.last_counter = Some(auth_rsp.counter);
                    return Err(Error::Other(format!("counter went from {} to {}", last, auth_rsp.counter)));
                }
            }
            enrollment.last_counter = Some(auth_rsp.counter);
        }

        Ok(Some(auth_rsp.counter))
    }

    /// The key handle with its first byte flipped must be refused with `6A80`.
    pub fn sign_with_wrong_key_handle(&mut self, mode: ApduMode) -> Result<(), Error> {
        let mut enrollment = self.enrolled()?.clone();
        enrollment.response.key_handle_cert_sig[0] ^= 0x55;
        self.sign_with(mode, U2F_SW_WRONG_DATA, false, &enrollment.request, &enrollment.response)
            .map(|_| ())
    }

    /// The application id with its first byte flipped must be refused with `6A80`.
    pub fn sign_with_wrong_app_id(&mut self, mode: ApduMode) -> Result<(), Error> {
        let mut enrollment = self.enrolled()?.clone();
        enrollment.request.application[0] ^= 0xaa;
        self.sign_with(mode, U2F_SW_WRONG_DATA, false, &enrollment.request, &enrollment.response)
            .map(|_| ())
    }

    /// Sequence for a token behind a contactless reader.
    pub fn run_nfc(&mut self) -> Result<(), Error> {
        use ApduMode::*;

        let res = self.select_applet();
        self.check("Applet Select - Check Version Response", res)?;

        let res = self
            .expect_rejection(Short, ISO_CLA, 0x00, &[], U2F_SW_INS_NOT_SUPPORTED)
            .and_then(|_| self.expect_rejection(Extended, ISO_CLA, 0x00, &[], U2F_SW_INS_NOT_SUPPORTED));
        self.check("Check Unknown INS Response", res)?;

        let res = self.expect_rejection(Short, ISO_CLA, U2F_REGISTER, &[], U2F_SW_WRONG_LENGTH);
        self.check("Check Wrong Length U2F_REGISTER Response", res)?;

        let block_size = self.transport.block_size();
        let res = self.enroll(Short, U2F_SW_NO_ERROR);
        self.check("Valid U2F_REGISTER, Short APDU", res)?;

        self.transport.set_block_size(100)?;
        let res = self.enroll(Short, U2F_SW_NO_ERROR);
        self.transport.set_block_size(block_size)?;
        self.check("Valid U2F_REGISTER, Short APDU, Change BlockSize", res)?;

        let res = self.enroll(Extended, U2F_SW_NO_ERROR);
        self.check("Valid U2F_REGISTER, Extended APDU", res)?;

        let res = self.sign(Short, U2F_SW_NO_ERROR, false);
        self.check("Valid U2F_AUTH, Short APDU", res)?;

        let res = self.sign(Extended, U2F_SW_NO_ERROR, false);
        self.check("Valid U2F_AUTH, Extended APDU", res)?;

        let res = self.sign_with_wrong_key_handle(Short);
        self.check("Test Auth with wrong keyHandle", res)?;

        let res = self.sign_with_wrong_app_id(Extended);
        self.check("Test Auth with wrong AppId", res)?;

        let res = self.sign(Short, U2F_SW_NO_ERROR, false);
        self.check("ReTest Valid U2F_AUTH, Short APDU", res)?;

        let res = self.sign(Extended, U2F_SW_NO_ERROR, false);
        self.check("ReTest U2F_AUTH, Extended APDU", res)?;

        let res = self.enroll(Extended, U2F_SW_NO_ERROR);
        self.check("Valid U2F_REGISTER, Extended APDU", res)?;

        let res = self.sign(Extended, U2F_SW_NO_ERROR, false);
        self.check("Valid U2F_AUTH, Extended APDU", res)?;

        let res = self.enroll(Short, U2F_SW_NO_ERROR);
        self.check("Valid U2F_REGISTER, Short APDU", res)?;

        let res = self.sign(Short, U2F_SW_NO_ERROR, false);
        self.check("Valid U2F_AUTH, Short APDU", res)?;

        self.summary();
        Ok(())
    }

    fn summary(&self) {
        let report = self.report();
        info!(
            "{} checks passed, {} failed, {} slow transactions",
            report.passed,
            report.failed.len(),
            report.latency_violations
        );
    }
}

impl<D: HidDevice> ComplianceSuite<HidTransport<D>> {
    /// Drops the channel, lets the operator touch or re-insert the token, then opens a new channel.
    pub fn wait_for_user_presence(&mut self) -> Result<(), Error> {
        self.transport.close();
        let prompt = if self.config.has_button {
            "Touch device and hit enter.."
        } else {
            "Re-insert device and hit enter.."
        };
        self.operator.prompt(prompt);

        self.transport.raw_mut().reopen()?;
        self.transport.reconnect()
    }

    pub fn ping(&mut self, len: usize) -> Result<(), Error> {
        let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let echo = self.transport.raw_mut().ping(&payload)?;
        if echo != payload {
            return Err(Error::Other(format!("PING echoed {} bytes out of {}", echo.len(), len)));
        }
        Ok(())
    }

    /// Sequence for a token on USB.
    pub fn run_hid(&mut self) -> Result<(), Error> {
        use ApduMode::Extended;

        let res = self.ping(8).and_then(|_| self.ping(1024));
        self.check("U2FHID PING echo", res)?;

        let res = self.version();
        self.check("U2F_VERSION", res)?;

        let res = self.expect_rejection(Extended, ISO_CLA, 0x00, &[], U2F_SW_INS_NOT_SUPPORTED);
        self.check("Unknown INS", res)?;

        let res = self.expect_rejection(Extended, ISO_CLA, U2F_VERSION, b"abc", U2F_SW_WRONG_LENGTH);
        self.check("Wrong length U2F_VERSION", res)?;

        let res = self.expect_rejection(Extended, ISO_CLA, U2F_REGISTER, b"abc", U2F_SW_WRONG_LENGTH);
        self.check("Wrong length U2F_REGISTER", res)?;

        let res = self.expect_rejection(Extended, 0x01, U2F_VERSION, b"abc", U2F_SW_CLA_NOT_SUPPORTED);
        self.check("Bad CLA", res)?;

        if self.config.has_button {
            let res = self.enroll(Extended, U2F_SW_CONDITIONS_NOT_SATISFIED);
            self.check("U2F_REGISTER needs a touch", res)?;
        }

        self.wait_for_user_presence()?;

        let res = self.enroll(Extended, U2F_SW_NO_ERROR);
        self.check("U2F_REGISTER", res)?;

        if self.config.has_button {
            let res = self.sign(Extended, U2F_SW_CONDITIONS_NOT_SATISFIED, false);
            self.check("U2F_REGISTER consumed the touch", res)?;
        }

        let res = self.sign(Extended, U2F_SW_CONDITIONS_NOT_SATISFIED, true);
        self.check("Check-only U2F_AUTHENTICATE gives no signature", res)?;

        let res = self.sign_with_wrong_key_handle(Extended);
        self.check("U2F_AUTHENTICATE with wrong key handle", res)?;

        let res = self.sign_with_wrong_app_id(Extended);
        self.check("U2F_AUTHENTICATE with wrong AppId", res)?;

        self.wait_for_user_presence()?;

        let res = self.sign(Extended, U2F_SW_CONDITIONS_NOT_SATISFIED, true);
        self.check("Check-only U2F_AUTHENTICATE keeps the touch", res)?;

        let res = self.sign(Extended, U2F_SW_NO_ERROR, false);
        self.check("U2F_AUTHENTICATE", res)?;

        if self.config.has_button {
            let res = self.sign(Extended, U2F_SW_CONDITIONS_NOT_SATISFIED, false);
            self.check("U2F_AUTHENTICATE consumed the touch", res)?;
        }

        self.wait_for_user_presence()?;

        let res = self.sign(Extended, U2F_SW_NO_ERROR, false);
        self.check("U2F_AUTHENTICATE counter incremented by one", res)?;

        self.summary();
        Ok(())
    }
}
