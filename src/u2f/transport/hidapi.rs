use std::ffi::{CStr, CString};

use ::hidapi::{HidApi, HidDevice as RawHidDevice, HidError};
use tracing::debug;

use crate::u2f::error::{Error, TransportError};
use crate::u2f::hid_proto::hid_const::{FIDO_USAGE_PAGE, FIDO_USAGE_U2FHID, HID_RPT_SIZE};
use crate::u2f::hid_proto::HidDevice;

impl From<HidError> for Error {
    fn from(e: HidError) -> Self {
        Error::Transport(TransportError::Io(e.to_string()))
    }
}

/// Paths of every attached device exposing the U2FHID usage.
pub fn list_devices() -> Result<Vec<String>, Error> {
    let api = HidApi::new()?;
    Ok(api
        .device_list()
        .filter(|d| d.usage_page() == FIDO_USAGE_PAGE && d.usage() == FIDO_USAGE_U2FHID)
        .map(|d| d.path().to_string_lossy().into_owned())
        .collect())
}

pub struct HidApiDevice {
    api: HidApi,
    path: CString,
    device: RawHidDevice,
}

impl HidApiDevice {
    pub fn open(path: &str) -> Result<Self, Error> {
        let api = HidApi::new()?;
        let path = CString::new(path).map_err(|e| Error::Config(format!("invalid device path: {}", e)))?;
        let device = api.open_path(&path)?;
        debug!("opened {}", path.to_string_lossy());

        Ok(HidApiDevice { api, path, device })
    }

    pub fn path(&self) -> &CStr {
        &self.path
    }
}

impl HidDevice for HidApiDevice {
    fn write_report(&mut self, report: &[u8; HID_RPT_SIZE]) -> Result<(), Error> {
        // Report id 0 goes first.
        let mut out = [0u8; HID_RPT_SIZE + 1];
        out[1..].copy_from_slice(report);

        let written = self.device.write(&out)?;
        if written < HID_RPT_SIZE {
            return Err(TransportError::Io(format!("short HID write of {} bytes", written)).into());
        }
        Ok(())
    }

    fn read_report(&mut self, timeout_ms: i32) -> Result<Option<[u8; HID_RPT_SIZE]>, Error> {
        let mut report = [0u8; HID_RPT_SIZE];
        match self.device.read_timeout(&mut report, timeout_ms)? {
            0 => Ok(None),
            _ => Ok(Some(report)),
        }
    }

    fn reopen(&mut self) -> Result<(), Error> {
        self.device = self.api.open_path(&self.path)?;
        Ok(())
    }
}
