//! Protocol module containing the message envelope and its validation gate.

pub mod messages;
pub mod validate;

pub use messages::{
    generate_message_id, now_millis, ControlAction, MessagePayload, MessageType, SimMessage,
};
pub use validate::{is_known_type, validate_envelope, KNOWN_TYPES};
