//! WebSocket protocol core (RFC 6455): framing, validation, reassembly and
//! the opening handshake. Nothing in here performs I/O.

pub mod assembler;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod opcode;
pub mod utf8;
pub mod validation;

pub use assembler::MessageAssembler;
pub use frame::{Frame, MAX_CONTROL_FRAME_PAYLOAD};
pub use handshake::{
    HandshakeRequest, HandshakeResponse, Headers, WS_GUID, compute_accept_key, generate_key,
    select_subprotocol, validate_origin,
};
pub use mask::{apply_mask, apply_mask_fast, generate_mask};
pub use opcode::OpCode;
pub use utf8::Utf8Validator;
pub use validation::FrameValidator;
