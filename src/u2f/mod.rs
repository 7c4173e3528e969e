pub mod client;
pub mod error;
pub mod hid_proto;
pub mod proto;
pub mod transport;
pub mod verifier;
