pub mod asn1;
pub mod codec;
pub mod constants;
pub mod raw_message;
