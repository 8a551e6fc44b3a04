//! Modbus TCP protocol codec

pub mod codec;
pub mod constants;
pub mod pdu;

pub use codec::{
    decode_frame, encode_response, frame_len, MbapCodec, MbapHeader, RequestAdu, ResponseAdu,
};
pub use pdu::{ModbusPdu, PduBuilder};
