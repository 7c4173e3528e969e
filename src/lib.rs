//#![deny(warnings)]

//! # u2f-compliance
//!
//! Compliance checks for U2F authenticators, over NFC readers (ISO 7816-4 APDU) and USB HID.

/// Module for the U2F raw message protocol, transports and test sequences
pub mod u2f;
