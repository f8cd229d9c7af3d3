//! Parameter groups: READ/WRITE encoding, mapping metadata and the
//! request/response client.

pub mod client;
pub mod codec;
pub mod mapping;

pub use client::{read_group, send_exit, write_group};
pub use codec::{
    ParamError, ReadResponse, ack_matches, ack_payload, build_read_request, build_write_frame,
    parse_ack, parse_read_response, validate_write, write_payload,
};
pub use mapping::{GroupMapping, ParamDescriptor, compare_keys};
