use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::u2f::error::{Error, MalformedResponse};
use crate::u2f::proto::constants::*;
use crate::u2f::proto::raw_message::apdu::{ApduFrame, Request, Response};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterRequest {
    pub challenge: [u8; U2F_CHAL_SIZE],
    pub application: [u8; U2F_APPID_SIZE],
}

/// REGISTER response as it came off the wire.
///
/// `key_handle_cert_sig` holds the key handle, the attestation certificate and the attestation
/// signature back to back. Only the key handle carries an explicit length; the certificate and
/// signature boundaries are found by reading their DER headers (see `proto::asn1`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterResponse {
    pub register_id: u8,
    pub user_public_key: [u8; U2F_EC_POINT_SIZE],
    pub key_handle_len: u8,
    pub key_handle_cert_sig: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticateRequest {
    pub control: u8,
    pub challenge: [u8; U2F_CHAL_SIZE],
    pub application: [u8; U2F_APPID_SIZE],
    pub key_handle: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticateResponse {
    pub user_presence: u8,
    pub counter: u32,
    pub signature: Vec<u8>,
}

pub struct VersionRequest {}

pub struct VersionResponse {
    pub version: String,
}

pub trait Message {
    type Apdu: ApduFrame;
    fn from_apdu(apdu: Self::Apdu) -> Result<Self, Error>
    where
        Self: Sized;
    fn into_apdu(self) -> Result<Self::Apdu, Error>;
}

impl RegisterResponse {
    const HEADER_LEN: usize = 1 + U2F_EC_POINT_SIZE + 1;

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < Self::HEADER_LEN {
            return Err(MalformedResponse::ShortResponse {
                expected: Self::HEADER_LEN,
                actual: data.len(),
            }
            .into());
        }

        let mut cursor = Cursor::new(data);
        let register_id = cursor.read_u8()?;

        let mut user_public_key = [0u8; U2F_EC_POINT_SIZE];
        cursor.read_exact(&mut user_public_key)?;

        let key_handle_len = cursor.read_u8()?;

        Ok(RegisterResponse {
            register_id,
            user_public_key,
            key_handle_len,
            key_handle_cert_sig: data[Self::HEADER_LEN..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(Self::HEADER_LEN + self.key_handle_cert_sig.len());
        data.push(self.register_id);
        data.extend_from_slice(&self.user_public_key);
        data.push(self.key_handle_len);
        data.extend_from_slice(&self.key_handle_cert_sig);
        data
    }

    pub fn point_format(&self) -> u8 {
        self.user_public_key[0]
    }

    /// The key handle as currently held in the trailing region.
    pub fn key_handle(&self) -> Result<&[u8], Error> {
        let len = self.key_handle_len as usize;
        if len < U2F_MIN_KH_SIZE {
            return Err(MalformedResponse::KeyHandleLength(len).into());
        }

        self.key_handle_cert_sig.get(..len).ok_or_else(|| {
            MalformedResponse::Truncated {
                needed: len,
                available: self.key_handle_cert_sig.len(),
            }
            .into()
        })
    }
}

impl AuthenticateResponse {
    pub const HEADER_LEN: usize = 1 + U2F_CTR_SIZE;

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < Self::HEADER_LEN {
            return Err(MalformedResponse::ShortResponse {
                expected: Self::HEADER_LEN,
                actual: data.len(),
            }
            .into());
        }

        let mut cursor = Cursor::new(data);
        let user_presence = cursor.read_u8()?;
        let counter = cursor.read_u32::<BigEndian>()?;

        Ok(AuthenticateResponse {
            user_presence,
            counter,
            signature: data[Self::HEADER_LEN..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(Self::HEADER_LEN + self.signature.len());
        data.push(self.user_presence);
        data.extend_from_slice(&self.counter.to_be_bytes());
        data.extend_from_slice(&self.signature);
        data
    }
}

impl AuthenticateRequest {
    /// Builds the request replaying the key handle of an earlier registration.
    pub fn for_registration(
        control: u8,
        challenge: [u8; U2F_CHAL_SIZE],
        reg_req: &RegisterRequest,
        reg_rsp: &RegisterResponse,
    ) -> Result<Self, Error> {
        Ok(AuthenticateRequest {
            control,
            challenge,
            application: reg_req.application,
            key_handle: reg_rsp.key_handle()?.to_vec(),
        })
    }

    pub fn payload(&self) -> Result<Vec<u8>, Error> {
        let key_h_len = u8::try_from(self.key_handle.len()).map_err(|_| MalformedResponse::KeyHandleLength(self.key_handle.len()))?;

        let mut data = Vec::with_capacity(U2F_CHAL_SIZE + U2F_APPID_SIZE + 1 + self.key_handle.len());
        data.write_all(&self.challenge)?;
        data.write_all(&self.application)?;
        data.write_u8(key_h_len)?;
        data.write_all(&self.key_handle)?;
        Ok(data)
    }
}

impl RegisterRequest {
    pub fn payload(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(U2F_CHAL_SIZE + U2F_APPID_SIZE);
        data.extend_from_slice(&self.challenge);
        data.extend_from_slice(&self.application);
        data
    }
}

impl Message for RegisterRequest {
    type Apdu = Request;

    fn from_apdu(apdu: Self::Apdu) -> Result<Self, Error>
    where
        Self: Sized,
    {
        if apdu.command_mode != U2F_REGISTER {
            return Err(Error::UnexpectedApdu(format!("Expecting Register Command Mode, got {}", apdu.command_mode)));
        }

        let data = apdu.data.ok_or(Error::MalformedApdu)?;
        if data.len() != U2F_CHAL_SIZE + U2F_APPID_SIZE {
            return Err(Error::MalformedApdu);
        }

        let mut cursor = Cursor::new(data);

        let mut challenge = [0u8; U2F_CHAL_SIZE];
        cursor.read_exact(&mut challenge)?;

        let mut application = [0u8; U2F_APPID_SIZE];
        cursor.read_exact(&mut application)?;

        Ok(RegisterRequest { challenge, application })
    }

    fn into_apdu(self) -> Result<Self::Apdu, Error> {
        Ok(Request {
            class_byte: ISO_CLA,
            command_mode: U2F_REGISTER,
            param_1: U2F_AUTH_ENFORCE,
            param_2: 0,
            data: Some(self.payload()),
            max_rsp_len: Some(U2F_REGISTER_RSP_MAX_SIZE),
            extended: true,
        })
    }
}

impl Message for RegisterResponse {
    type Apdu = Response;

    fn from_apdu(apdu: Self::Apdu) -> Result<Self, Error>
    where
        Self: Sized,
    {
        if apdu.status != U2F_SW_NO_ERROR {
            return Err(apdu.status.into());
        }

        apdu.data.ok_or(Error::MalformedApdu).and_then(|data| RegisterResponse::from_bytes(&data))
    }

    fn into_apdu(self) -> Result<Self::Apdu, Error> {
        Ok(Response {
            data: Some(self.to_bytes()),
            status: U2F_SW_NO_ERROR,
        })
    }
}

impl Message for AuthenticateRequest {
    type Apdu = Request;

    fn from_apdu(apdu: Self::Apdu) -> Result<Self, Error>
    where
        Self: Sized,
    {
        if apdu.command_mode != U2F_AUTHENTICATE {
            return Err(Error::UnexpectedApdu(format!("Expecting Authenticate Command Mode, got {}", apdu.command_mode)));
        }

        let control = apdu.param_1;

        match control {
            U2F_AUTH_CHECK_ONLY | U2F_AUTH_ENFORCE | U2F_AUTH_DONT_ENFORCE => {}
            _ => {
                return Err(Error::MalformedApdu);
            }
        }

        let data = apdu.data.ok_or(Error::MalformedApdu)?;
        let data_len = data.len();
        let mut cursor = Cursor::new(data);

        let mut challenge = [0u8; U2F_CHAL_SIZE];
        cursor.read_exact(&mut challenge)?;

        let mut application = [0u8; U2F_APPID_SIZE];
        cursor.read_exact(&mut application)?;

        let key_h_len = cursor.read_u8()? as usize;
        if data_len != U2F_CHAL_SIZE + U2F_APPID_SIZE + 1 + key_h_len {
            return Err(Error::MalformedApdu);
        }

        let mut key_handle = vec![0u8; key_h_len];
        cursor.read_exact(&mut key_handle[..])?;

        Ok(AuthenticateRequest {
            control,
            challenge,
            application,
            key_handle,
        })
    }

    fn into_apdu(self) -> Result<Self::Apdu, Error> {
        Ok(Request {
            class_byte: ISO_CLA,
            command_mode: U2F_AUTHENTICATE,
            param_1: self.control,
            param_2: 0,
            data: Some(self.payload()?),
            max_rsp_len: Some(U2F_AUTH_RSP_MAX_SIZE),
            extended: true,
        })
    }
}

impl Message for AuthenticateResponse {
    type Apdu = Response;

    fn from_apdu(apdu: Self::Apdu) -> Result<Self, Error>
    where
        Self: Sized,
    {
        if apdu.status != U2F_SW_NO_ERROR {
            return Err(apdu.status.into());
        }

        apdu.data.ok_or(Error::MalformedApdu).and_then(|data| AuthenticateResponse::from_bytes(&data))
    }

    fn into_apdu(self) -> Result<Self::Apdu, Error> {
        Ok(Response {
            data: Some(self.to_bytes()),
            status: U2F_SW_NO_ERROR,
        })
    }
}

impl Message for VersionRequest {
    type Apdu = Request;

    fn from_apdu(apdu: Self::Apdu) -> Result<Self, Error>
    where
        Self: Sized,
    {
        if apdu.command_mode != U2F_VERSION {
            return Err(Error::UnexpectedApdu(format!("Expecting Version Command Mode, got {}", apdu.command_mode)));
        }

        // U2F_VERSION takes no input.
        if apdu.data.as_ref().map(|d| !d.is_empty()).unwrap_or(false) {
            return Err(Error::MalformedApdu);
        }

        Ok(VersionRequest {})
    }

    fn into_apdu(self) -> Result<Self::Apdu, Error> {
        Ok(Request {
            class_byte: ISO_CLA,
            command_mode: U2F_VERSION,
            param_1: 0,
            param_2: 0,
            data: None,
            max_rsp_len: Some(MAX_RESPONSE_LEN_SHORT),
            extended: true,
        })
    }
}

impl Message for VersionResponse {
    type Apdu = Response;

    fn from_apdu(apdu: Self::Apdu) -> Result<Self, Error>
    where
        Self: Sized,
    {
        if apdu.status != U2F_SW_NO_ERROR {
            return Err(apdu.status.into());
        }

        apdu.data.ok_or(Error::MalformedApdu).and_then(|data| {
            Ok(VersionResponse {
                version: String::from_utf8(data).map_err(|e| Error::UnexpectedApdu(format!("Got error while parsing version string: {:?}", e)))?,
            })
        })
    }

    fn into_apdu(self) -> Result<Self::Apdu, Error> {
        Ok(Response {
            data: Some(self.version.as_bytes().to_vec()),
            status: U2F_SW_NO_ERROR,
        })
    }
}

pub mod apdu {
    use std::io::Write;

    use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

    use crate::u2f::error::{Error, TransportError};
    use crate::u2f::proto::codec;
    use crate::u2f::proto::constants::{MAX_COMMAND_DATA_EXTENDED, MAX_RESPONSE_LEN_EXTENDED, MAX_RESPONSE_LEN_SHORT};

    /// Header plus the largest extended body: `00 LcHi LcLo data LeHi LeLo`.
    pub const MAX_EXTENDED_APDU_SIZE: usize = 4 + 3 + MAX_COMMAND_DATA_EXTENDED + 2;
    /// Header plus the largest short body: `Lc data Le`.
    pub const MAX_SHORT_APDU_SIZE: usize = 4 + 1 + 255 + 1;

    pub trait ApduFrame {
        fn read_from(slice: &[u8]) -> Result<Self, Error>
        where
            Self: Sized;
        fn write_to<W: Write>(self, writer: &mut W) -> Result<(), Error>;
        fn get_frame_size(&self) -> usize;
    }

    /// ISO 7816-4 command cases, short (S) and extended (E) length forms.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ApduCase {
        Case1,
        Case2Short,
        Case3Short,
        Case4Short,
        Case2Extended,
        Case3Extended,
        Case4Extended,
    }

    impl ApduCase {
        pub fn is_extended(self) -> bool {
            matches!(self, ApduCase::Case2Extended | ApduCase::Case3Extended | ApduCase::Case4Extended)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Request {
        pub class_byte: u8,
        pub command_mode: u8,
        pub param_1: u8,
        pub param_2: u8,
        pub data: Option<Vec<u8>>,
        pub max_rsp_len: Option<usize>,
        pub extended: bool,
    }

    impl Request {
        pub fn data(&self) -> &[u8] {
            self.data.as_deref().unwrap_or(&[])
        }

        /// Decodes a command APDU and reports which ISO case it was.
        pub fn decode(slice: &[u8]) -> Result<(Self, ApduCase), Error> {
            if slice.len() < 4 {
                return Err(Error::MalformedApdu);
            }

            let (class_byte, command_mode, param_1, param_2) = (slice[0], slice[1], slice[2], slice[3]);
            let body = &slice[4..];

            let short_le = |b: u8| if b == 0 { MAX_RESPONSE_LEN_SHORT } else { b as usize };
            let extended_le = |b: &[u8]| match BigEndian::read_u16(b) {
                0 => MAX_RESPONSE_LEN_EXTENDED,
                le => le as usize,
            };

            let (data, max_rsp_len, case) = match body.len() {
                0 => (None, None, ApduCase::Case1),
                1 => (None, Some(short_le(body[0])), ApduCase::Case2Short),
                len if body[0] != 0 && len == 1 + body[0] as usize => (Some(body[1..].to_vec()), None, ApduCase::Case3Short),
                len if body[0] != 0 && len == 2 + body[0] as usize => {
                    let lc = body[0] as usize;
                    (Some(body[1..1 + lc].to_vec()), Some(short_le(body[1 + lc])), ApduCase::Case4Short)
                }
                3 if body[0] == 0 => (None, Some(extended_le(&body[1..3])), ApduCase::Case2Extended),
                len if body[0] == 0 && len >= 3 => {
                    let lc = BigEndian::read_u16(&body[1..3]) as usize;
                    if len == 3 + lc {
                        (Some(body[3..].to_vec()), None, ApduCase::Case3Extended)
                    } else if len == 5 + lc {
                        (Some(body[3..3 + lc].to_vec()), Some(extended_le(&body[3 + lc..])), ApduCase::Case4Extended)
                    } else {
                        return Err(Error::MalformedApdu);
                    }
                }
                _ => return Err(Error::MalformedApdu),
            };

            Ok((
                Request {
                    class_byte,
                    command_mode,
                    param_1,
                    param_2,
                    data,
                    max_rsp_len,
                    extended: case.is_extended(),
                },
                case,
            ))
        }

        pub fn encode(&self) -> Result<Vec<u8>, Error> {
            let builder = ApduBuilder::with_capacity(if self.extended {
                MAX_EXTENDED_APDU_SIZE
            } else {
                MAX_SHORT_APDU_SIZE
            })
            .header(self.class_byte, self.command_mode, self.param_1, self.param_2)?;

            let builder = if self.extended {
                builder.extended_body(self.data(), self.max_rsp_len)?
            } else {
                builder.short_body(self.data(), self.max_rsp_len)?
            };

            Ok(builder.build())
        }
    }

    impl ApduFrame for Request {
        fn read_from(slice: &[u8]) -> Result<Self, Error>
        where
            Self: Sized,
        {
            Request::decode(slice).map(|(req, _)| req)
        }

        fn write_to<W: Write>(self, writer: &mut W) -> Result<(), Error> {
            writer.write_all(&self.encode()?)?;
            Ok(())
        }

        fn get_frame_size(&self) -> usize {
            let data_len = self.data().len();
            let mut len = 4;

            if self.extended {
                if data_len > 0 || self.max_rsp_len.is_some() {
                    len += 3 + data_len;
                }
                if self.max_rsp_len.is_some() {
                    len += 2;
                }
            } else {
                if data_len > 0 {
                    len += 1 + data_len;
                }
                if self.max_rsp_len.is_some() {
                    len += 1;
                }
            }

            len
        }
    }

    /// Command APDU encoder that checks the output capacity at every append.
    pub struct ApduBuilder {
        buf: Vec<u8>,
        capacity: usize,
    }

    impl ApduBuilder {
        pub fn with_capacity(capacity: usize) -> Self {
            ApduBuilder {
                buf: Vec::with_capacity(capacity.min(MAX_EXTENDED_APDU_SIZE)),
                capacity,
            }
        }

        fn put(&mut self, bytes: &[u8]) -> Result<(), Error> {
            let needed = self.buf.len() + bytes.len();
            if needed > self.capacity {
                return Err(TransportError::Overflow {
                    needed,
                    capacity: self.capacity,
                }
                .into());
            }
            self.buf.extend_from_slice(bytes);
            Ok(())
        }

        pub fn header(mut self, cla: u8, ins: u8, p1: u8, p2: u8) -> Result<Self, Error> {
            self.put(&[cla, ins, p1, p2])?;
            Ok(self)
        }

        /// `[Lc data] [Le]`, one byte each; `Le = 256` is written as `0x00`.
        pub fn short_body(mut self, data: &[u8], le: Option<usize>) -> Result<Self, Error> {
            if data.len() > 255 {
                return Err(TransportError::Overflow {
                    needed: data.len(),
                    capacity: 255,
                }
                .into());
            }

            if !data.is_empty() {
                self.put(&[data.len() as u8])?;
                self.put(data)?;
            }

            if let Some(le) = le {
                match le {
                    1..=255 => self.put(&[le as u8])?,
                    MAX_RESPONSE_LEN_SHORT => self.put(&[0x00])?,
                    _ => {
                        return Err(TransportError::InvalidLe {
                            le,
                            max: MAX_RESPONSE_LEN_SHORT,
                        }
                        .into())
                    }
                }
            }

            Ok(self)
        }

        /// `00 LcHi LcLo data [LeHi LeLo]`; `Le = 65536` is written as `0x0000`.
        ///
        /// The three byte Lc field is emitted even for an empty payload so that both lengths are
        /// present on the wire.
        pub fn extended_body(mut self, data: &[u8], le: Option<usize>) -> Result<Self, Error> {
            if data.len() > MAX_COMMAND_DATA_EXTENDED {
                return Err(TransportError::Overflow {
                    needed: data.len(),
                    capacity: MAX_COMMAND_DATA_EXTENDED,
                }
                .into());
            }

            if data.is_empty() && le.is_none() {
                return Ok(self);
            }

            self.put(&[0x00])?;
            self.put(&codec::u16_be(data.len() as u16))?;
            self.put(data)?;

            if let Some(le) = le {
                match le {
                    1..=65535 => self.put(&codec::u16_be(le as u16))?,
                    MAX_RESPONSE_LEN_EXTENDED => self.put(&[0x00, 0x00])?,
                    _ => {
                        return Err(TransportError::InvalidLe {
                            le,
                            max: MAX_RESPONSE_LEN_EXTENDED,
                        }
                        .into())
                    }
                }
            }

            Ok(self)
        }

        pub fn build(self) -> Vec<u8> {
            self.buf
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Response {
        pub data: Option<Vec<u8>>,
        pub status: u16,
    }

    impl Response {
        pub fn from_status(sw: u16) -> Self {
            Response { data: None, status: sw }
        }

        pub fn new(data: Vec<u8>, status: u16) -> Self {
            Response {
                data: if data.is_empty() { None } else { Some(data) },
                status,
            }
        }

        pub fn body(&self) -> &[u8] {
            self.data.as_deref().unwrap_or(&[])
        }

        pub fn to_bytes(&self) -> Vec<u8> {
            let mut out = Vec::with_capacity(self.get_frame_size());
            out.extend_from_slice(self.body());
            out.extend_from_slice(&codec::u16_be(self.status));
            out
        }
    }

    impl ApduFrame for Response {
        fn read_from(slice: &[u8]) -> Result<Self, Error>
        where
            Self: Sized,
        {
            let (body, status) = codec::split_status(slice)?;
            Ok(Response::new(body.to_vec(), status))
        }

        fn write_to<W: Write>(self, writer: &mut W) -> Result<(), Error> {
            let Response { data, status } = self;

            if let Some(data) = data {
                writer.write_all(&data[..])?;
            }

            Ok(writer.write_u16::<BigEndian>(status)?)
        }

        fn get_frame_size(&self) -> usize {
            2 + self.body().len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::apdu::*;
    use super::*;

    #[test]
    fn short_case_4_encoding() {
        let req = Request {
            class_byte: 0,
            command_mode: ISO_INS_SELECT,
            param_1: 0x04,
            param_2: 0,
            data: Some(U2F_APPLET_AID.to_vec()),
            max_rsp_len: Some(256),
            extended: false,
        };

        let bytes = req.encode().unwrap();
        assert_eq!(bytes, vec![0x00, 0xa4, 0x04, 0x00, 0x08, 0xa0, 0x00, 0x00, 0x06, 0x47, 0x2f, 0x00, 0x01, 0x00]);
        assert_eq!(bytes.len(), req.get_frame_size());

        let (decoded, case) = Request::decode(&bytes).unwrap();
        assert_eq!(case, ApduCase::Case4Short);
        assert_eq!(decoded, req);
    }

    #[test]
    fn extended_empty_payload_keeps_both_lengths() {
        let req = Request {
            class_byte: 0,
            command_mode: 0,
            param_1: 0,
            param_2: 0,
            data: None,
            max_rsp_len: Some(MAX_RESPONSE_LEN_EXTENDED),
            extended: true,
        };

        let bytes = req.encode().unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(bytes.len(), req.get_frame_size());

        let (decoded, case) = Request::decode(&bytes).unwrap();
        assert_eq!(case, ApduCase::Case4Extended);
        assert_eq!(decoded.data(), &[] as &[u8]);
        assert_eq!(decoded.max_rsp_len, Some(MAX_RESPONSE_LEN_EXTENDED));
    }

    #[test]
    fn decode_classifies_iso_cases() {
        assert_eq!(Request::decode(&[0, 1, 0, 0]).unwrap().1, ApduCase::Case1);

        let (req, case) = Request::decode(&[0, 0xc0, 0, 0, 0]).unwrap();
        assert_eq!(case, ApduCase::Case2Short);
        assert_eq!(req.max_rsp_len, Some(256));

        assert_eq!(Request::decode(&[0, 1, 0, 0, 2, 0xaa, 0xbb]).unwrap().1, ApduCase::Case3Short);

        let (req, case) = Request::decode(&[0, 3, 0, 0, 0, 0x01, 0x00]).unwrap();
        assert_eq!(case, ApduCase::Case2Extended);
        assert_eq!(req.max_rsp_len, Some(256));
        assert!(req.extended);

        let (req, case) = Request::decode(&[0, 1, 0, 0, 0, 0, 2, 0xaa, 0xbb]).unwrap();
        assert_eq!(case, ApduCase::Case3Extended);
        assert_eq!(req.data(), &[0xaa, 0xbb]);

        assert!(Request::decode(&[0, 1, 0]).is_err());
        assert!(Request::decode(&[0, 1, 0, 0, 5, 1]).is_err());
        assert!(Request::decode(&[0, 1, 0, 0, 0, 0, 9, 1]).is_err());
    }

    #[test]
    fn builder_rejects_overflow() {
        let res = ApduBuilder::with_capacity(6).header(0, 1, 0, 0).and_then(|b| b.short_body(&[1, 2, 3], None));
        match res {
            Err(Error::Transport(crate::u2f::error::TransportError::Overflow { needed, capacity })) => {
                assert_eq!(capacity, 6);
                assert_eq!(needed, 8);
            }
            _ => panic!("expected overflow"),
        }

        assert!(ApduBuilder::with_capacity(64).short_body(&[0u8; 256], None).is_err());
        assert!(ApduBuilder::with_capacity(64).short_body(&[], Some(257)).is_err());
    }

    #[test]
    fn builder_length_errors_are_typed() {
        use crate::u2f::error::TransportError;

        assert!(matches!(
            ApduBuilder::with_capacity(512).short_body(&[0u8; 256], None),
            Err(Error::Transport(TransportError::Overflow { needed: 256, capacity: 255 }))
        ));
        assert!(matches!(
            ApduBuilder::with_capacity(64).short_body(&[], Some(0)),
            Err(Error::Transport(TransportError::InvalidLe { le: 0, max: MAX_RESPONSE_LEN_SHORT }))
        ));
        assert!(matches!(
            ApduBuilder::with_capacity(MAX_EXTENDED_APDU_SIZE + 16).extended_body(&vec![0u8; MAX_COMMAND_DATA_EXTENDED + 1], None),
            Err(Error::Transport(TransportError::Overflow { capacity: MAX_COMMAND_DATA_EXTENDED, .. }))
        ));
        assert!(matches!(
            ApduBuilder::with_capacity(64).extended_body(&[], Some(MAX_RESPONSE_LEN_EXTENDED + 1)),
            Err(Error::Transport(TransportError::InvalidLe { max: MAX_RESPONSE_LEN_EXTENDED, .. }))
        ));
    }

    #[test]
    fn register_response_layout() {
        let mut bytes = vec![U2F_REGISTER_ID];
        bytes.push(U2F_POINT_UNCOMPRESSED);
        bytes.extend_from_slice(&[0x11; 64]);
        bytes.push(32);
        bytes.extend_from_slice(&[0x22; 32]);
        bytes.extend_from_slice(&[0x30, 0x81, 0x00]);

        let rsp = RegisterResponse::from_bytes(&bytes).unwrap();
        assert_eq!(rsp.register_id, U2F_REGISTER_ID);
        assert_eq!(rsp.point_format(), U2F_POINT_UNCOMPRESSED);
        assert_eq!(rsp.key_handle().unwrap(), &[0x22; 32][..]);
        assert_eq!(rsp.to_bytes(), bytes);

        let short = RegisterResponse {
            key_handle_len: 31,
            ..rsp.clone()
        };
        assert!(short.key_handle().is_err());

        let truncated = RegisterResponse {
            key_handle_len: 200,
            ..rsp
        };
        assert!(truncated.key_handle().is_err());

        assert!(RegisterResponse::from_bytes(&[0x05; 10]).is_err());
    }

    #[test]
    fn authenticate_counter_is_big_endian() {
        let rsp = AuthenticateResponse::from_bytes(&[0x01, 0x00, 0x00, 0x01, 0x02, 0x30, 0x00]).unwrap();
        assert_eq!(rsp.user_presence, 0x01);
        assert_eq!(rsp.counter, 0x0102);
        assert_eq!(rsp.signature, vec![0x30, 0x00]);
        assert_eq!(rsp.to_bytes(), vec![0x01, 0x00, 0x00, 0x01, 0x02, 0x30, 0x00]);
        assert!(AuthenticateResponse::from_bytes(&[0x01, 0x00]).is_err());
    }

    #[test]
    fn authenticate_request_round_trip() {
        let req = AuthenticateRequest {
            control: U2F_AUTH_ENFORCE,
            challenge: [1; 32],
            application: [2; 32],
            key_handle: vec![3; 64],
        };

        let apdu = req.clone().into_apdu().unwrap();
        assert_eq!(apdu.data().len(), 32 + 32 + 1 + 64);
        assert_eq!(AuthenticateRequest::from_apdu(apdu).unwrap(), req);
    }

    #[test]
    fn version_request_rejects_payload() {
        let mut apdu = VersionRequest {}.into_apdu().unwrap();
        apdu.data = Some(b"abc".to_vec());
        assert!(VersionRequest::from_apdu(apdu).is_err());
    }
}
