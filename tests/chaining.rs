use proptest::prelude::*;
use proptest::collection;

use u2f_compliance::u2f::client::token::SoftToken;
use u2f_compliance::u2f::error::{Error, TransportError};
use u2f_compliance::u2f::hid_proto::{HidTransport, VirtualHidToken};
use u2f_compliance::u2f::proto::constants::*;
use u2f_compliance::u2f::transport::{ApduMode, ApduTransport, RawTransport, TransportConfig};

fn open(block_size: usize) -> ApduTransport<SoftToken> {
    let config = TransportConfig {
        block_size,
        ..TransportConfig::default()
    };
    ApduTransport::open(SoftToken::simple().unwrap(), config).unwrap()
}

fn echo(transport: &mut ApduTransport<SoftToken>, mode: ApduMode, payload: &[u8]) -> (Vec<u8>, u16) {
    transport
        .exchange(mode, ISO_CLA, U2F_VENDOR_ECHO, 0x00, 0x00, payload, MAX_RESPONSE_LEN_EXTENDED)
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn short_chaining_round_trip(block_size in 1usize..=256, payload in collection::vec(any::<u8>(), 0..=4096)) {
        let mut transport = open(block_size);
        let (body, sw) = echo(&mut transport, ApduMode::Short, &payload);
        prop_assert_eq!(sw, U2F_SW_NO_ERROR);
        prop_assert_eq!(body, payload);
    }

    #[test]
    fn extended_round_trip(payload in collection::vec(any::<u8>(), 0..=MAX_COMMAND_DATA_EXTENDED)) {
        let mut transport = open(MAX_RESPONSE_LEN_SHORT);
        let (body, sw) = echo(&mut transport, ApduMode::Extended, &payload);
        prop_assert_eq!(sw, U2F_SW_NO_ERROR);
        prop_assert_eq!(body, payload);
    }
}

#[test]
fn short_chaining_largest_payload() {
    let payload: Vec<u8> = (0..MAX_COMMAND_DATA_EXTENDED).map(|i| (i % 251) as u8).collect();

    for block_size in [256, 255, 100, 7] {
        let mut transport = open(block_size);
        let (body, sw) = echo(&mut transport, ApduMode::Short, &payload);
        assert_eq!(sw, U2F_SW_NO_ERROR);
        assert_eq!(body, payload);
    }
}

#[test]
fn block_size_change_between_exchanges() {
    let payload = vec![0x5a; 700];
    let mut transport = open(256);
    assert_eq!(echo(&mut transport, ApduMode::Short, &payload).0, payload);

    transport.set_block_size(100).unwrap();
    assert_eq!(echo(&mut transport, ApduMode::Short, &payload).0, payload);

    assert!(matches!(transport.set_block_size(0), Err(Error::Config(_))));
    assert!(matches!(transport.set_block_size(257), Err(Error::Config(_))));
    assert_eq!(transport.block_size(), 100);
}

#[test]
fn response_larger_than_capacity_overflows() {
    let mut transport = open(256);
    let res = transport.exchange(ApduMode::Short, ISO_CLA, U2F_VENDOR_ECHO, 0x00, 0x00, &[0u8; 600], 512);
    assert!(matches!(res, Err(Error::Transport(TransportError::Overflow { .. }))));
}

/// Sends an extended answer to everything.
struct Chatty;

impl RawTransport for Chatty {
    fn transmit(&mut self, _capdu: &[u8], _max_response: usize) -> Result<Vec<u8>, Error> {
        let mut rapdu = vec![0u8; 300];
        rapdu.extend_from_slice(&[0x90, 0x00]);
        Ok(rapdu)
    }
}

#[test]
fn short_response_longer_than_block_is_a_chain_violation() {
    let mut transport = ApduTransport::open(Chatty, TransportConfig::default()).unwrap();
    let res = transport.exchange(ApduMode::Short, ISO_CLA, U2F_VERSION, 0x00, 0x00, &[], MAX_RESPONSE_LEN_SHORT);
    assert!(matches!(res, Err(Error::Transport(TransportError::ChainViolation(_)))));
}

#[test]
fn short_response_longer_than_block_over_hid_is_a_chain_violation() {
    let hid = HidTransport::new(VirtualHidToken::new(Chatty));
    let mut transport = ApduTransport::open(hid, TransportConfig::default()).unwrap();
    let res = transport.exchange(ApduMode::Short, ISO_CLA, U2F_VERSION, 0x00, 0x00, &[], MAX_RESPONSE_LEN_SHORT);
    assert!(matches!(res, Err(Error::Transport(TransportError::ChainViolation(_)))));
}
