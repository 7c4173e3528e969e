//! Byte-order and hex helpers shared by the transport, extractor and verifier.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::u2f::error::{Error, MalformedResponse};

/// Upper-case hex, the form used in compliance logs.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

pub fn from_hex(s: &str) -> Result<Vec<u8>, Error> {
    hex::decode(s).map_err(|e| Error::Other(format!("invalid hex string: {}", e)))
}

#[inline]
pub fn status_word(sw1: u8, sw2: u8) -> u16 {
    (sw1 as u16) << 8 | sw2 as u16
}

/// Splits a response APDU into its body and trailing status word.
pub fn split_status(rapdu: &[u8]) -> Result<(&[u8], u16), Error> {
    if rapdu.len() < 2 {
        return Err(MalformedResponse::ShortResponse {
            expected: 2,
            actual: rapdu.len(),
        }
        .into());
    }

    let (body, sw) = rapdu.split_at(rapdu.len() - 2);
    Ok((body, BigEndian::read_u16(sw)))
}

pub fn read_u16_be(bytes: &[u8]) -> Option<u16> {
    (bytes.len() >= 2).then(|| BigEndian::read_u16(bytes))
}

pub fn read_u32_be(bytes: &[u8]) -> Option<u32> {
    (bytes.len() >= 4).then(|| BigEndian::read_u32(bytes))
}

pub fn read_u32_le(bytes: &[u8]) -> Option<u32> {
    (bytes.len() >= 4).then(|| LittleEndian::read_u32(bytes))
}

pub fn u16_be(value: u16) -> [u8; 2] {
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, value);
    buf
}

pub fn u32_be(value: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    buf
}

/// Classic 16 bytes per line dump with an ASCII column.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);

    for (line, chunk) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("{:04x}:", line * 16));
        for (i, b) in chunk.iter().enumerate() {
            out.push(if i == 8 { '-' } else { ' ' });
            out.push_str(&format!("{:02x}", b));
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push_str(" <");
        out.extend(chunk.iter().map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' }));
        out.push_str(">\n");
    }

    out
}

#[test]
fn hex_round_trip_is_upper_case() {
    let bytes = [0x00, 0x9f, 0xa0, 0xff];
    let s = to_hex(&bytes);
    assert_eq!(s, "009FA0FF");
    assert_eq!(from_hex(&s).unwrap(), bytes.to_vec());
    assert_eq!(from_hex("009fa0ff").unwrap(), bytes.to_vec());
    assert!(from_hex("0g").is_err());
}

#[test]
fn status_word_is_big_endian() {
    assert_eq!(status_word(0x90, 0x00), 0x9000);
    let (body, sw) = split_status(&[0x01, 0x02, 0x6a, 0x80]).unwrap();
    assert_eq!(body, &[0x01, 0x02]);
    assert_eq!(sw, 0x6a80);
    assert!(split_status(&[0x90]).is_err());
}

#[test]
fn endian_helpers() {
    assert_eq!(read_u32_be(&[0, 0, 1, 2]), Some(0x0102));
    assert_eq!(read_u32_le(&[2, 1, 0, 0]), Some(0x0102));
    assert_eq!(read_u16_be(&[1]), None);
    assert_eq!(u32_be(0x0a0b0c0d), [0x0a, 0x0b, 0x0c, 0x0d]);
    assert_eq!(u16_be(0x6100), [0x61, 0x00]);
}

#[test]
fn hex_dump_layout() {
    let dump = hex_dump(b"U2F_V2\x90\x00");
    assert!(dump.starts_with("0000: 55 32 46 5f 56 32 90 00"));
    assert!(dump.trim_end().ends_with("<U2F_V2..>"));
}
