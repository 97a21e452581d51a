//! Protocol module - envelope layout and stream decoding.
//!
//! - [`Envelope`] with its three variants [`Call`], [`Response`], [`Notification`]
//! - [`decode`] for one-shot incremental decoding
//! - [`EnvelopeBuffer`] for accumulating partial socket reads

mod envelope;
mod envelope_buffer;

pub use envelope::{decode, tag, Call, Decoded, Envelope, Notification, Response};
pub use envelope_buffer::{EnvelopeBuffer, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_MESSAGE_SIZE};
