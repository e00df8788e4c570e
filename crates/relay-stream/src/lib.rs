//! Uniform stream-event contract and the per-provider chunk decoders.
//!
//! Decoders are pure functions from raw chunk text to zero or more
//! [`StreamEvent`]s plus a [`TokenUsage`] accumulator; they perform no I/O.
//! Every well-formed stream obeys `start content* usage? done` or
//! `start content* error`.

mod anthropic;
mod cursor;
mod event;
mod google;
mod openai;

pub use anthropic::decode_anthropic_event;
pub use cursor::decode_cursor_frame;
pub use event::{DecodeError, StreamEvent, TokenUsage};
pub use google::decode_google_chunk;
pub use openai::decode_openai_data;
