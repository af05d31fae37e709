// Core types and primitives

pub mod channel;

// Re-export commonly used types
pub use channel::{channel_from_json, validate_channel, Channel, ChannelArg};
