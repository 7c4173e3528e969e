//! ISO 7816-4 command/response exchange on top of a raw transmit primitive.
//!
//! Short mode splits large payloads into chained blocks and collects `61XX` continuations with
//! GET RESPONSE. Extended mode sends a single APDU and expects the whole answer back at once.

use std::time::{Duration, Instant};

use serde_derive::Deserialize;
use tracing::{debug, trace, warn};

use crate::u2f::error::{Error, TransportError};
use crate::u2f::proto::codec;
use crate::u2f::proto::constants::*;
use crate::u2f::proto::raw_message::apdu::{ApduBuilder, Request, Response, MAX_EXTENDED_APDU_SIZE, MAX_SHORT_APDU_SIZE};

#[cfg(feature = "usb-hid")]
pub mod hidapi;
#[cfg(feature = "nfc")]
pub mod pcsc;

/// Largest short-mode chain block payload; the single byte Lc cannot express 256.
const MAX_SHORT_BLOCK_DATA: usize = 255;
/// Short answers are received into a full sized buffer so that oversized ones can be classified.
const MAX_SHORT_RECEIVE: usize = MAX_RESPONSE_LEN_EXTENDED + 2;

/// The physical link: one command APDU out, one response APDU back.
pub trait RawTransport {
    fn connect(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// `max_response` is the largest response (body and status word) the caller can accept.
    fn transmit(&mut self, capdu: &[u8], max_response: usize) -> Result<Vec<u8>, Error>;

    fn disconnect(&mut self) {}
}

impl<T: RawTransport + ?Sized> RawTransport for Box<T> {
    fn connect(&mut self) -> Result<(), Error> {
        (**self).connect()
    }

    fn transmit(&mut self, capdu: &[u8], max_response: usize) -> Result<Vec<u8>, Error> {
        (**self).transmit(capdu, max_response)
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApduMode {
    Short,
    Extended,
}

impl ApduMode {
    pub fn max_response_len(self) -> usize {
        match self {
            ApduMode::Short => MAX_RESPONSE_LEN_SHORT,
            ApduMode::Extended => MAX_RESPONSE_LEN_EXTENDED,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Short-mode chain block size, 1 to 256.
    pub block_size: usize,
    /// Round trips slower than this are logged and counted, not failed.
    pub timeout_ms: u64,
    /// Upper bound on any reassembled response body.
    pub max_response_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            block_size: MAX_RESPONSE_LEN_SHORT,
            timeout_ms: NFC_TIMEOUT_MS,
            max_response_len: MAX_RESPONSE_LEN_EXTENDED,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), Error> {
        check_block_size(self.block_size)?;
        if self.max_response_len == 0 || self.max_response_len > MAX_RESPONSE_LEN_EXTENDED {
            return Err(Error::Config(format!("max_response_len {} out of range", self.max_response_len)));
        }
        Ok(())
    }
}

fn check_block_size(block_size: usize) -> Result<(), Error> {
    if !(1..=MAX_RESPONSE_LEN_SHORT).contains(&block_size) {
        return Err(Error::Config(format!("block size {} out of range 1..=256", block_size)));
    }
    Ok(())
}

/// A session with one device. Dropping it disconnects.
pub struct ApduTransport<T: RawTransport> {
    raw: T,
    config: TransportConfig,
    open: bool,
    latency_violations: usize,
}

impl<T: RawTransport> ApduTransport<T> {
    pub fn open(mut raw: T, config: TransportConfig) -> Result<Self, Error> {
        config.validate()?;
        raw.connect()?;

        Ok(ApduTransport {
            raw,
            config,
            open: true,
            latency_violations: 0,
        })
    }

    pub fn close(&mut self) {
        if self.open {
            self.raw.disconnect();
            self.open = false;
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn reconnect(&mut self) -> Result<(), Error> {
        self.close();
        self.raw.connect()?;
        self.open = true;
        Ok(())
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub fn set_block_size(&mut self, block_size: usize) -> Result<(), Error> {
        check_block_size(block_size)?;
        debug!("block size set to {}", block_size);
        self.config.block_size = block_size;
        Ok(())
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn latency_violations(&self) -> usize {
        self.latency_violations
    }

    pub fn raw(&self) -> &T {
        &self.raw
    }

    pub fn raw_mut(&mut self) -> &mut T {
        &mut self.raw
    }

    fn round_trip(&mut self, capdu: &[u8], max_response: usize) -> Result<Vec<u8>, Error> {
        if !self.open {
            return Err(TransportError::Closed.into());
        }

        trace!("C-APDU:\n{}", codec::hex_dump(capdu));

        let started = Instant::now();
        let rapdu = self.raw.transmit(capdu, max_response)?;
        let elapsed = started.elapsed();

        trace!("R-APDU:\n{}", codec::hex_dump(&rapdu));

        if elapsed > Duration::from_millis(self.config.timeout_ms) {
            self.latency_violations += 1;
            warn!(
                "transaction took {} ms, limit is {} ms",
                elapsed.as_millis(),
                self.config.timeout_ms
            );
        } else {
            debug!("transaction time {} us", elapsed.as_micros());
        }

        Ok(rapdu)
    }

    /// Sends `payload` under `INS/P1/P2` and returns the reassembled body with its final status word.
    ///
    /// `capacity` bounds the body the caller is willing to receive; a larger body is an `Overflow`.
    #[allow(clippy::too_many_arguments)]
    pub fn exchange(
        &mut self,
        mode: ApduMode,
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        payload: &[u8],
        capacity: usize,
    ) -> Result<(Vec<u8>, u16), Error> {
        // Zero asks for the most the mode can return, never for an empty body.
        let capacity = match (capacity, mode) {
            (0, ApduMode::Short) => self.config.block_size,
            (0, ApduMode::Extended) => MAX_RESPONSE_LEN_EXTENDED,
            (capacity, _) => capacity,
        };
        let capacity = capacity.min(self.config.max_response_len);
        match mode {
            ApduMode::Short => self.exchange_short(cla, ins, p1, p2, payload, capacity),
            ApduMode::Extended => self.exchange_extended(cla, ins, p1, p2, payload, capacity),
        }
    }

    /// Sends a decoded request and wraps the answer back into a response APDU.
    pub fn send(&mut self, mode: ApduMode, req: &Request) -> Result<Response, Error> {
        let capacity = req.max_rsp_len.unwrap_or_else(|| mode.max_response_len());
        let (body, sw) = self.exchange(
            mode,
            req.class_byte,
            req.command_mode,
            req.param_1,
            req.param_2,
            req.data(),
            capacity,
        )?;
        Ok(Response::new(body, sw))
    }

    /// Sends an already encoded command APDU untouched, for forms the builder does not produce.
    pub fn transmit_raw(&mut self, capdu: &[u8], capacity: usize) -> Result<(Vec<u8>, u16), Error> {
        let rapdu = self.round_trip(capdu, capacity + 2)?;
        let (body, sw) = codec::split_status(&rapdu)?;
        check_capacity(body.len(), capacity)?;
        Ok((body.to_vec(), sw))
    }

    fn check_short_response(&self, rapdu: &[u8]) -> Result<(), Error> {
        let limit = self.config.block_size + 2;
        if rapdu.len() > limit {
            return Err(TransportError::ChainViolation(format!(
                "{} byte response to a short APDU with block size {}",
                rapdu.len(),
                self.config.block_size
            ))
            .into());
        }
        Ok(())
    }

    fn send_short_block(&mut self, cla: u8, ins: u8, p1: u8, p2: u8, data: &[u8]) -> Result<(Vec<u8>, u16), Error> {
        let block_size = self.config.block_size;

        let capdu = ApduBuilder::with_capacity(MAX_SHORT_APDU_SIZE)
            .header(cla, ins, p1, p2)?
            .short_body(data, Some(block_size))?
            .build();

        let rapdu = self.round_trip(&capdu, MAX_SHORT_RECEIVE)?;
        self.check_short_response(&rapdu)?;
        let (body, sw) = codec::split_status(&rapdu)?;
        Ok((body.to_vec(), sw))
    }

    pub fn exchange_short(&mut self, cla: u8, ins: u8, p1: u8, p2: u8, payload: &[u8], capacity: usize) -> Result<(Vec<u8>, u16), Error> {
        let block_size = self.config.block_size;
        let chunk_size = block_size.min(MAX_SHORT_BLOCK_DATA);

        let mut blocks: Vec<&[u8]> = payload.chunks(chunk_size).collect();
        let last = blocks.pop().unwrap_or(&[]);
        let total = blocks.len() + 1;

        for (i, block) in blocks.iter().enumerate() {
            let (body, sw) = self.send_short_block(cla | ISO_CLA_CHAINING, ins, p1, p2, block)?;
            if sw != U2F_SW_NO_ERROR {
                debug!("chain block {}/{} rejected with 0x{:04X}", i + 1, total, sw);
                return Ok((body, sw));
            }
        }

        let (mut body, mut sw) = self.send_short_block(cla, ins, p1, p2, last)?;
        check_capacity(body.len(), capacity)?;

        while (sw >> 8) as u8 == U2F_SW_BYTES_REMAINING {
            let remaining = (sw & 0xff) as usize;
            let le = if remaining == 0 { block_size } else { remaining.min(block_size) };

            debug!("0x{:04X}: GET RESPONSE for {} bytes", sw, le);

            let capdu = ApduBuilder::with_capacity(MAX_SHORT_APDU_SIZE)
                .header(ISO_CLA, ISO_INS_GET_RESPONSE, 0x00, 0x00)?
                .short_body(&[], Some(le))?
                .build();

            let rapdu = self.round_trip(&capdu, MAX_SHORT_RECEIVE)?;
            self.check_short_response(&rapdu)?;
            let (more, next_sw) = codec::split_status(&rapdu)?;

            if more.is_empty() && (next_sw >> 8) as u8 == U2F_SW_BYTES_REMAINING {
                return Err(TransportError::ChainViolation("GET RESPONSE returned no data".to_string()).into());
            }

            check_capacity(body.len() + more.len(), capacity)?;
            body.extend_from_slice(more);
            sw = next_sw;
        }

        Ok((body, sw))
    }

    pub fn exchange_extended(&mut self, cla: u8, ins: u8, p1: u8, p2: u8, payload: &[u8], capacity: usize) -> Result<(Vec<u8>, u16), Error> {
        let capacity = match capacity {
            0 => MAX_RESPONSE_LEN_EXTENDED,
            capacity => capacity.min(MAX_RESPONSE_LEN_EXTENDED),
        };

        let capdu = ApduBuilder::with_capacity(MAX_EXTENDED_APDU_SIZE)
            .header(cla, ins, p1, p2)?
            .extended_body(payload, Some(capacity))?
            .build();

        let rapdu = self.round_trip(&capdu, capacity + 2)?;
        let (body, sw) = codec::split_status(&rapdu)?;

        if (sw >> 8) as u8 == U2F_SW_BYTES_REMAINING {
            return Err(Error::ProtocolViolation(format!(
                "chained response 0x{:04X} to an extended APDU",
                sw
            )));
        }

        check_capacity(body.len(), capacity)?;
        Ok((body.to_vec(), sw))
    }
}

fn check_capacity(len: usize, capacity: usize) -> Result<(), Error> {
    if len > capacity {
        return Err(TransportError::Overflow { needed: len, capacity }.into());
    }
    Ok(())
}

impl<T: RawTransport> Drop for ApduTransport<T> {
    fn drop(&mut self) {
        self.close();
    }
}
