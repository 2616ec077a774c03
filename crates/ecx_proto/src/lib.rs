//! Wire envelope between two engine instances.
//!
//! The relay between the instances is a dumb byte pipe: it sees framing and
//! routing, never plaintext. Everything the receiving ratchet needs to line
//! up its chains travels in the clear header; confidentiality comes from the
//! AEAD over the payload with the header bound as associated data.

mod envelope;

pub use envelope::{EnvelopeError, HandshakePrelude, SessionEnvelope, WIRE_VERSION};
