use std::collections::VecDeque;

use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, trace};

use crate::u2f::error::{Error, TransportError};
use crate::u2f::proto::codec;
use crate::u2f::proto::constants::MAX_RESPONSE_LEN_EXTENDED;
use crate::u2f::transport::RawTransport;

use self::hid_const::*;
use self::hid_type::*;

pub mod hid_const {
    // From : Common U2F HID transport header - Review Draft
    // 2014-10-08

    // Size of HID reports

    pub const HID_RPT_SIZE: usize = 64; // Default size of raw HID report

    // Frame layout - command- and continuation frames

    pub const CID_BROADCAST: u32 = 0xffffffff; // Broadcast channel id

    pub const TYPE_MASK: u8 = 0x80; // Frame type mask
    pub const TYPE_INIT: u8 = 0x80; // Initial frame identifier
    pub const TYPE_CONT: u8 = 0x00; // Continuation frame identifier

    pub const INIT_DATA_SIZE: usize = HID_RPT_SIZE - 7; // Payload of an initial frame
    pub const CONT_DATA_SIZE: usize = HID_RPT_SIZE - 5; // Payload of a continuation frame
    pub const MAX_CONT_FRAMES: usize = 128; // Sequence numbers 0..=0x7f
    pub const MAX_MESSAGE_SIZE: usize = INIT_DATA_SIZE + MAX_CONT_FRAMES * CONT_DATA_SIZE; // 7609

    // HID usage- and usage-page definitions

    pub const FIDO_USAGE_PAGE: u16 = 0xf1d0; // FIDO alliance HID usage page
    pub const FIDO_USAGE_U2FHID: u16 = 0x01; // U2FHID usage for top-level collection

    // General constants

    pub const U2FHID_IF_VERSION: u8 = 2; // Current interface implementation version
    pub const U2FHID_TRANS_TIMEOUT: i32 = 3000; // Default message timeout in ms

    // U2FHID native commands

    pub const U2FHID_PING: u8 = TYPE_INIT | 0x01; // Echo data through local processor only
    pub const U2FHID_MSG: u8 = TYPE_INIT | 0x03; // Send U2F message frame
    pub const U2FHID_LOCK: u8 = TYPE_INIT | 0x04; // Send lock channel command
    pub const U2FHID_INIT: u8 = TYPE_INIT | 0x06; // Channel initialization
    pub const U2FHID_WINK: u8 = TYPE_INIT | 0x08; // Send device identification wink
    pub const U2FHID_ERROR: u8 = TYPE_INIT | 0x3f; // Error response

    // U2FHID_INIT command defines

    pub const INIT_NONCE_SIZE: usize = 8; // Size of channel initialization challenge
    pub const INIT_RSP_SIZE: usize = INIT_NONCE_SIZE + 4 + 5; // nonce, cid, versions and caps
    pub const CAPFLAG_WINK: u8 = 0x01; // Device supports WINK command

    // Low-level error codes

    pub const ERR_NONE: u8 = 0x00; // No error
    pub const ERR_INVALID_CMD: u8 = 0x01; // Invalid command
    pub const ERR_INVALID_PAR: u8 = 0x02; // Invalid parameter
    pub const ERR_INVALID_LEN: u8 = 0x03; // Invalid message length
    pub const ERR_INVALID_SEQ: u8 = 0x04; // Invalid message sequencing
    pub const ERR_MSG_TIMEOUT: u8 = 0x05; // Message has timed out
    pub const ERR_CHANNEL_BUSY: u8 = 0x06; // Channel busy
    pub const ERR_OTHER: u8 = 0x7f; // Other unspecified error
}

pub mod hid_type {
    use crate::u2f::error::{Error, TransportError};
    use crate::u2f::hid_proto::hid_const::*;
    use crate::u2f::proto::codec;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Packet {
        Init {
            cmd: u8,                      // Frame type - b7 defines type
            bcnt: u16,                    // Message byte count
            data: [u8; INIT_DATA_SIZE],   // Data payload
        },
        Cont {
            seq: u8,                      // Frame type - b7 defines type
            data: [u8; CONT_DATA_SIZE],   // Data payload
        },
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct U2fHidFrame {
        pub cid: u32, // Channel identifier
        pub packet: Packet,
    }

    impl U2fHidFrame {
        #[inline]
        pub fn frame_type(&self) -> u8 {
            match self.packet {
                Packet::Init { cmd, .. } => cmd & TYPE_MASK,
                Packet::Cont { seq, .. } => seq & TYPE_MASK,
            }
        }

        #[inline]
        pub fn frame_cmd(&self) -> Option<u8> {
            match self.packet {
                Packet::Init { cmd, .. } => Some(cmd),
                _ => None,
            }
        }

        #[inline]
        pub fn frame_seq(&self) -> Option<u8> {
            match self.packet {
                Packet::Cont { seq, .. } => Some(seq & !TYPE_MASK),
                _ => None,
            }
        }

        #[inline]
        pub fn msg_len(&self) -> Option<u16> {
            match self.packet {
                Packet::Init { bcnt, .. } => Some(bcnt),
                _ => None,
            }
        }

        pub fn data(&self) -> &[u8] {
            match &self.packet {
                Packet::Init { data, .. } => &data[..],
                Packet::Cont { data, .. } => &data[..],
            }
        }

        pub fn to_report(&self) -> [u8; HID_RPT_SIZE] {
            let mut report = [0u8; HID_RPT_SIZE];
            report[..4].copy_from_slice(&codec::u32_be(self.cid));

            match &self.packet {
                Packet::Init { cmd, bcnt, data } => {
                    report[4] = *cmd;
                    report[5..7].copy_from_slice(&codec::u16_be(*bcnt));
                    report[7..].copy_from_slice(data);
                }
                Packet::Cont { seq, data } => {
                    report[4] = *seq;
                    report[5..].copy_from_slice(data);
                }
            }

            report
        }

        pub fn from_report(report: &[u8]) -> Result<Self, Error> {
            if report.len() < HID_RPT_SIZE {
                return Err(TransportError::Io(format!("short HID report of {} bytes", report.len())).into());
            }

            let cid = codec::read_u32_be(report).unwrap_or(0);

            let packet = if report[4] & TYPE_MASK == TYPE_INIT {
                let mut data = [0u8; INIT_DATA_SIZE];
                data.copy_from_slice(&report[7..HID_RPT_SIZE]);
                Packet::Init {
                    cmd: report[4],
                    bcnt: codec::read_u16_be(&report[5..7]).unwrap_or(0),
                    data,
                }
            } else {
                let mut data = [0u8; CONT_DATA_SIZE];
                data.copy_from_slice(&report[5..HID_RPT_SIZE]);
                Packet::Cont { seq: report[4], data }
            };

            Ok(U2fHidFrame { cid, packet })
        }
    }

    /// Splits a message into one initial frame and as many continuation frames as needed.
    pub fn fragment(cid: u32, cmd: u8, payload: &[u8]) -> Result<Vec<U2fHidFrame>, Error> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::Overflow {
                needed: payload.len(),
                capacity: MAX_MESSAGE_SIZE,
            }
            .into());
        }

        let first_len = payload.len().min(INIT_DATA_SIZE);
        let mut data = [0u8; INIT_DATA_SIZE];
        data[..first_len].copy_from_slice(&payload[..first_len]);

        let mut frames = vec![U2fHidFrame {
            cid,
            packet: Packet::Init {
                cmd,
                bcnt: payload.len() as u16,
                data,
            },
        }];

        for (seq, chunk) in payload[first_len..].chunks(CONT_DATA_SIZE).enumerate() {
            let mut data = [0u8; CONT_DATA_SIZE];
            data[..chunk.len()].copy_from_slice(chunk);
            frames.push(U2fHidFrame {
                cid,
                packet: Packet::Cont { seq: seq as u8, data },
            });
        }

        Ok(frames)
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct U2fHidInitRsp {
        pub nonce: [u8; INIT_NONCE_SIZE], // Client application nonce
        pub cid: u32,                     // Channel identifier
        pub interface_version: u8,        // Interface version
        pub major_version: u8,            // Major version number
        pub minor_version: u8,            // Minor version number
        pub build_version: u8,            // Build version number
        pub cap_flags: u8,                // Capabilities flags
    }

    impl U2fHidInitRsp {
        pub fn from_bytes(data: &[u8]) -> Option<Self> {
            if data.len() < INIT_RSP_SIZE {
                return None;
            }

            let mut nonce = [0u8; INIT_NONCE_SIZE];
            nonce.copy_from_slice(&data[..INIT_NONCE_SIZE]);

            Some(U2fHidInitRsp {
                nonce,
                cid: codec::read_u32_be(&data[8..12])?,
                interface_version: data[12],
                major_version: data[13],
                minor_version: data[14],
                build_version: data[15],
                cap_flags: data[16],
            })
        }

        pub fn to_bytes(&self) -> Vec<u8> {
            let mut out = Vec::with_capacity(INIT_RSP_SIZE);
            out.extend_from_slice(&self.nonce);
            out.extend_from_slice(&codec::u32_be(self.cid));
            out.extend_from_slice(&[
                self.interface_version,
                self.major_version,
                self.minor_version,
                self.build_version,
                self.cap_flags,
            ]);
            out
        }
    }
}

/// One raw HID endpoint. Reports are 64 bytes, without report id.
pub trait HidDevice {
    fn write_report(&mut self, report: &[u8; HID_RPT_SIZE]) -> Result<(), Error>;

    /// Returns `None` when nothing arrived within `timeout_ms`.
    fn read_report(&mut self, timeout_ms: i32) -> Result<Option<[u8; HID_RPT_SIZE]>, Error>;

    /// Closes and opens the device again, dropping any channel state.
    fn reopen(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Frames that may be skipped while waiting for an answer on our channel.
const MAX_STRAY_FRAMES: usize = 64;

/// U2FHID client: channel allocation plus message framing and reassembly.
pub struct HidTransport<D: HidDevice> {
    device: D,
    cid: u32,
    timeout_ms: i32,
    info: Option<U2fHidInitRsp>,
}

impl<D: HidDevice> HidTransport<D> {
    pub fn new(device: D) -> Self {
        HidTransport {
            device,
            cid: CID_BROADCAST,
            timeout_ms: U2FHID_TRANS_TIMEOUT,
            info: None,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: i32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn info(&self) -> Option<&U2fHidInitRsp> {
        self.info.as_ref()
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    fn read_frame(&mut self) -> Result<U2fHidFrame, Error> {
        let report = self.device.read_report(self.timeout_ms)?.ok_or(TransportError::Timeout)?;
        trace!("<< {}", codec::to_hex(&report));
        U2fHidFrame::from_report(&report)
    }

    fn write_frame(&mut self, frame: &U2fHidFrame) -> Result<(), Error> {
        let report = frame.to_report();
        trace!(">> {}", codec::to_hex(&report));
        self.device.write_report(&report)
    }

    /// Allocates a channel through the broadcast CID.
    pub fn init(&mut self) -> Result<U2fHidInitRsp, Error> {
        let mut nonce = [0u8; INIT_NONCE_SIZE];
        SystemRandom::new().fill(&mut nonce)?;

        let request = fragment(CID_BROADCAST, U2FHID_INIT, &nonce)?;
        for frame in &request {
            self.write_frame(frame)?;
        }

        for _ in 0..MAX_STRAY_FRAMES {
            let frame = self.read_frame()?;
            if frame.cid != CID_BROADCAST || frame.frame_cmd() != Some(U2FHID_INIT) {
                continue;
            }
            if frame.msg_len() != Some(INIT_RSP_SIZE as u16) {
                continue;
            }

            match U2fHidInitRsp::from_bytes(frame.data()) {
                Some(rsp) if rsp.nonce == nonce => {
                    debug!(
                        "channel 0x{:08x}, interface v{}, device {}.{}.{}, caps 0x{:02x}",
                        rsp.cid, rsp.interface_version, rsp.major_version, rsp.minor_version, rsp.build_version, rsp.cap_flags
                    );
                    self.cid = rsp.cid;
                    self.info = Some(rsp.clone());
                    return Ok(rsp);
                }
                _ => continue,
            }
        }

        Err(TransportError::Timeout.into())
    }

    pub fn send(&mut self, cmd: u8, payload: &[u8]) -> Result<(), Error> {
        for frame in fragment(self.cid, cmd, payload)? {
            self.write_frame(&frame)?;
        }
        Ok(())
    }

    /// Reassembles the next message on our channel. ERROR frames become `TransportError::Hid`.
    pub fn recv(&mut self) -> Result<(u8, Vec<u8>), Error> {
        let mut stray = 0;

        let first = loop {
            let frame = self.read_frame()?;
            if frame.cid == self.cid && frame.frame_type() == TYPE_INIT {
                break frame;
            }

            stray += 1;
            if stray >= MAX_STRAY_FRAMES {
                return Err(TransportError::Timeout.into());
            }
        };

        let cmd = first.frame_cmd().unwrap_or(U2FHID_ERROR);
        if cmd == U2FHID_ERROR {
            return Err(TransportError::Hid(first.data()[0]).into());
        }

        let total = first.msg_len().unwrap_or(0) as usize;
        if total > MAX_MESSAGE_SIZE {
            return Err(TransportError::ChainViolation(format!("declared message length {} exceeds {}", total, MAX_MESSAGE_SIZE)).into());
        }

        let mut msg = Vec::with_capacity(total);
        msg.extend_from_slice(&first.data()[..total.min(INIT_DATA_SIZE)]);

        let mut seq = 0u8;
        while msg.len() < total {
            let frame = self.read_frame()?;
            if frame.cid != self.cid {
                continue;
            }

            if frame.frame_seq() != Some(seq) {
                return Err(TransportError::ChainViolation(format!(
                    "expected continuation frame {}, got {:02x}",
                    seq,
                    frame.to_report()[4]
                ))
                .into());
            }

            let take = (total - msg.len()).min(CONT_DATA_SIZE);
            msg.extend_from_slice(&frame.data()[..take]);
            seq += 1;
        }

        Ok((cmd, msg))
    }

    pub fn message(&mut self, cmd: u8, payload: &[u8]) -> Result<(u8, Vec<u8>), Error> {
        self.send(cmd, payload)?;
        self.recv()
    }

    pub fn ping(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let (cmd, echo) = self.message(U2FHID_PING, payload)?;
        if cmd != U2FHID_PING {
            return Err(TransportError::Io(format!("PING answered with command 0x{:02x}", cmd)).into());
        }
        Ok(echo)
    }

    pub fn reopen(&mut self) -> Result<(), Error> {
        self.device.reopen()?;
        self.cid = CID_BROADCAST;
        self.init().map(|_| ())
    }
}

impl<D: HidDevice> RawTransport for HidTransport<D> {
    fn connect(&mut self) -> Result<(), Error> {
        if self.info.is_none() {
            self.init()?;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.cid = CID_BROADCAST;
        self.info = None;
    }

    fn transmit(&mut self, capdu: &[u8], max_response: usize) -> Result<Vec<u8>, Error> {
        let (cmd, rapdu) = self.message(U2FHID_MSG, capdu)?;
        if cmd != U2FHID_MSG {
            return Err(TransportError::Io(format!("MSG answered with command 0x{:02x}", cmd)).into());
        }

        if rapdu.len() > max_response {
            return Err(TransportError::Overflow {
                needed: rapdu.len(),
                capacity: max_response,
            }
            .into());
        }

        Ok(rapdu)
    }
}

/// In-memory U2FHID device in front of any APDU-level token.
pub struct VirtualHidToken<T: RawTransport> {
    token: T,
    next_cid: u32,
    pending: Option<(U2fHidFrame, Vec<u8>, u8)>,
    output: VecDeque<[u8; HID_RPT_SIZE]>,
}

impl<T: RawTransport> VirtualHidToken<T> {
    pub fn new(token: T) -> Self {
        VirtualHidToken {
            token,
            next_cid: 1,
            pending: None,
            output: VecDeque::new(),
        }
    }

    pub fn token(&self) -> &T {
        &self.token
    }

    pub fn token_mut(&mut self) -> &mut T {
        &mut self.token
    }

    fn reply(&mut self, cid: u32, cmd: u8, payload: &[u8]) -> Result<(), Error> {
        for frame in fragment(cid, cmd, payload)? {
            self.output.push_back(frame.to_report());
        }
        Ok(())
    }

    fn dispatch(&mut self, cid: u32, cmd: u8, msg: Vec<u8>) -> Result<(), Error> {
        match cmd {
            U2FHID_INIT => {
                if cid != CID_BROADCAST || msg.len() != INIT_NONCE_SIZE {
                    return self.reply(cid, U2FHID_ERROR, &[ERR_INVALID_PAR]);
                }

                let mut nonce = [0u8; INIT_NONCE_SIZE];
                nonce.copy_from_slice(&msg);

                let rsp = U2fHidInitRsp {
                    nonce,
                    cid: self.next_cid,
                    interface_version: U2FHID_IF_VERSION,
                    major_version: 0,
                    minor_version: 1,
                    build_version: 0,
                    cap_flags: 0,
                };
                self.next_cid += 1;
                self.reply(cid, U2FHID_INIT, &rsp.to_bytes())
            }
            U2FHID_PING => self.reply(cid, U2FHID_PING, &msg),
            U2FHID_MSG => match self.token.transmit(&msg, MAX_RESPONSE_LEN_EXTENDED + 2) {
                Ok(rapdu) => self.reply(cid, U2FHID_MSG, &rapdu),
                Err(_) => self.reply(cid, U2FHID_ERROR, &[ERR_OTHER]),
            },
            _ => self.reply(cid, U2FHID_ERROR, &[ERR_INVALID_CMD]),
        }
    }
}

impl<T: RawTransport> HidDevice for VirtualHidToken<T> {
    fn write_report(&mut self, report: &[u8; HID_RPT_SIZE]) -> Result<(), Error> {
        let frame = U2fHidFrame::from_report(report)?;

        match (frame.packet.clone(), self.pending.take()) {
            (Packet::Init { cmd, bcnt, data }, _) => {
                let total = bcnt as usize;
                if total > MAX_MESSAGE_SIZE {
                    return self.reply(frame.cid, U2FHID_ERROR, &[ERR_INVALID_LEN]);
                }

                let msg = data[..total.min(INIT_DATA_SIZE)].to_vec();
                if msg.len() == total {
                    self.dispatch(frame.cid, cmd, msg)
                } else {
                    self.pending = Some((frame, msg, 0));
                    Ok(())
                }
            }
            (Packet::Cont { seq, data }, Some((first, mut msg, expected))) => {
                if first.cid != frame.cid || seq != expected {
                    return self.reply(frame.cid, U2FHID_ERROR, &[ERR_INVALID_SEQ]);
                }

                let total = first.msg_len().unwrap_or(0) as usize;
                let take = (total - msg.len()).min(CONT_DATA_SIZE);
                msg.extend_from_slice(&data[..take]);

                if msg.len() == total {
                    self.dispatch(first.cid, first.frame_cmd().unwrap_or(U2FHID_ERROR), msg)
                } else {
                    self.pending = Some((first, msg, expected + 1));
                    Ok(())
                }
            }
            (Packet::Cont { .. }, None) => Ok(()),
        }
    }

    fn read_report(&mut self, _timeout_ms: i32) -> Result<Option<[u8; HID_RPT_SIZE]>, Error> {
        Ok(self.output.pop_front())
    }

    fn reopen(&mut self) -> Result<(), Error> {
        self.pending = None;
        self.output.clear();
        self.token.disconnect();
        self.token.connect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl RawTransport for Echo {
        fn transmit(&mut self, capdu: &[u8], _max_response: usize) -> Result<Vec<u8>, Error> {
            let mut rapdu = capdu.to_vec();
            rapdu.extend_from_slice(&[0x90, 0x00]);
            Ok(rapdu)
        }
    }

    #[test]
    fn frame_layout() {
        let frames = fragment(0x01020304, U2FHID_MSG, &[0xaa; 100]).unwrap();
        assert_eq!(frames.len(), 2);

        let init = frames[0].to_report();
        assert_eq!(&init[..7], &[0x01, 0x02, 0x03, 0x04, 0x83, 0x00, 100]);
        assert_eq!(init[7], 0xaa);

        let cont = frames[1].to_report();
        assert_eq!(&cont[..5], &[0x01, 0x02, 0x03, 0x04, 0x00]);
        assert_eq!(&cont[5..5 + 43], &[0xaa; 43][..]);
        assert_eq!(cont[5 + 43], 0);

        assert_eq!(U2fHidFrame::from_report(&init).unwrap(), frames[0]);
        assert_eq!(U2fHidFrame::from_report(&cont).unwrap(), frames[1]);
    }

    #[test]
    fn largest_message_uses_every_sequence_number() {
        let frames = fragment(1, U2FHID_PING, &vec![0x55; MAX_MESSAGE_SIZE]).unwrap();
        assert_eq!(frames.len(), 1 + MAX_CONT_FRAMES);
        assert_eq!(frames.last().and_then(|f| f.frame_seq()), Some(0x7f));
        assert!(fragment(1, U2FHID_PING, &vec![0x55; MAX_MESSAGE_SIZE + 1]).is_err());
    }

    #[test]
    fn init_then_ping_and_msg() {
        let mut hid = HidTransport::new(VirtualHidToken::new(Echo));
        let info = hid.init().unwrap();
        assert_eq!(info.cid, 1);
        assert_eq!(hid.cid(), 1);

        let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        assert_eq!(hid.ping(&payload).unwrap(), payload);

        let rapdu = hid.transmit(&[0x00, 0x03, 0x00, 0x00], 64).unwrap();
        assert_eq!(rapdu, vec![0x00, 0x03, 0x00, 0x00, 0x90, 0x00]);
    }

    #[test]
    fn error_frame_and_bad_sequence() {
        let mut hid = HidTransport::new(VirtualHidToken::new(Echo));
        hid.init().unwrap();

        let res = hid.message(U2FHID_WINK, &[]);
        assert!(matches!(res, Err(Error::Transport(TransportError::Hid(ERR_INVALID_CMD)))));

        let frames = fragment(hid.cid(), U2FHID_PING, &[0x11; 200]).unwrap();
        hid.device_mut().write_report(&frames[0].to_report()).unwrap();
        hid.device_mut().write_report(&frames[2].to_report()).unwrap();
        assert!(matches!(hid.recv(), Err(Error::Transport(TransportError::Hid(ERR_INVALID_SEQ)))));
    }

    #[test]
    fn foreign_channel_frames_are_skipped() {
        let mut hid = HidTransport::new(VirtualHidToken::new(Echo));
        hid.init().unwrap();

        let stray = fragment(0x0bad, U2FHID_PING, &[0x22; 4]).unwrap();
        hid.device_mut().output.push_back(stray[0].to_report());

        assert_eq!(hid.ping(&[1, 2, 3]).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn silent_device_times_out() {
        let mut hid = HidTransport::new(VirtualHidToken::new(Echo));
        hid.init().unwrap();
        assert!(matches!(hid.recv(), Err(Error::Transport(TransportError::Timeout))));
    }
}
