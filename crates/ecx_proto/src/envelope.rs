//! Fixed-field envelope framing, all integers big-endian.
//!
//! ```text
//! u8   version            (=1)
//! u8   flags              (bit0: has_opk_id, bit1: is_handshake_init)
//! u16  reserved           (=0)
//! [32] sender_dh_public
//! u32  message_index
//! u32  previous_chain_length
//! [if is_handshake_init]
//!   [32] sender_id_ed_pub
//!   [32] sender_id_x_pub
//!   [32] ephemeral_pub
//!   u32  opk_id           (if has_opk_id)
//! u32  ciphertext_len
//! []   ciphertext
//! [16] gcm_tag
//! ```
//!
//! The 16-byte tag rides detached after the ciphertext; the cryptographic
//! computation treats the two as concatenated.

use thiserror::Error;

pub const WIRE_VERSION: u8 = 1;

const FLAG_HAS_OPK_ID: u8 = 0b0000_0001;
const FLAG_HANDSHAKE_INIT: u8 = 0b0000_0010;
const KNOWN_FLAGS: u8 = FLAG_HAS_OPK_ID | FLAG_HANDSHAKE_INIT;

/// Ciphertext cap: 1 MiB of plaintext plus padding headroom.
const MAX_CIPHERTEXT_LEN: usize = (1 << 20) + 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Envelope truncated: need {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("Unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown flag bits 0b{0:08b}")]
    UnknownFlags(u8),

    #[error("Reserved field must be zero, got 0x{0:04x}")]
    NonZeroReserved(u16),

    #[error("opk_id flag set outside a handshake envelope")]
    OpkWithoutHandshake,

    #[error("Ciphertext length {0} exceeds the wire cap")]
    OversizedCiphertext(usize),

    #[error("{0} trailing bytes after the authentication tag")]
    TrailingBytes(usize),
}

/// Carried only on the session-initiating envelope so the responder can run
/// the mirror-image handshake derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePrelude {
    pub sender_id_ed_pub: [u8; 32],
    pub sender_id_x_pub: [u8; 32],
    pub ephemeral_pub: [u8; 32],
    pub opk_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnvelope {
    pub sender_dh_public: [u8; 32],
    pub message_index: u32,
    pub previous_chain_length: u32,
    pub prelude: Option<HandshakePrelude>,
    pub ciphertext: Vec<u8>,
    pub tag: [u8; 16],
}

impl SessionEnvelope {
    pub fn is_handshake_init(&self) -> bool {
        self.prelude.is_some()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if let Some(prelude) = &self.prelude {
            flags |= FLAG_HANDSHAKE_INIT;
            if prelude.opk_id.is_some() {
                flags |= FLAG_HAS_OPK_ID;
            }
        }

        let mut out = Vec::with_capacity(64 + self.ciphertext.len() + 128);
        out.push(WIRE_VERSION);
        out.push(flags);
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&self.sender_dh_public);
        out.extend_from_slice(&self.message_index.to_be_bytes());
        out.extend_from_slice(&self.previous_chain_length.to_be_bytes());
        if let Some(prelude) = &self.prelude {
            out.extend_from_slice(&prelude.sender_id_ed_pub);
            out.extend_from_slice(&prelude.sender_id_x_pub);
            out.extend_from_slice(&prelude.ephemeral_pub);
            if let Some(opk_id) = prelude.opk_id {
                out.extend_from_slice(&opk_id.to_be_bytes());
            }
        }
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut r = Reader::new(bytes);

        let version = r.u8()?;
        if version != WIRE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }
        let flags = r.u8()?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(EnvelopeError::UnknownFlags(flags & !KNOWN_FLAGS));
        }
        let reserved = r.u16()?;
        if reserved != 0 {
            return Err(EnvelopeError::NonZeroReserved(reserved));
        }
        let has_opk_id = flags & FLAG_HAS_OPK_ID != 0;
        let is_handshake = flags & FLAG_HANDSHAKE_INIT != 0;
        if has_opk_id && !is_handshake {
            return Err(EnvelopeError::OpkWithoutHandshake);
        }

        let sender_dh_public = r.array::<32>()?;
        let message_index = r.u32()?;
        let previous_chain_length = r.u32()?;

        let prelude = if is_handshake {
            Some(HandshakePrelude {
                sender_id_ed_pub: r.array::<32>()?,
                sender_id_x_pub: r.array::<32>()?,
                ephemeral_pub: r.array::<32>()?,
                opk_id: if has_opk_id { Some(r.u32()?) } else { None },
            })
        } else {
            None
        };

        let ct_len = r.u32()? as usize;
        if ct_len > MAX_CIPHERTEXT_LEN {
            return Err(EnvelopeError::OversizedCiphertext(ct_len));
        }
        let ciphertext = r.bytes(ct_len)?.to_vec();
        let tag = r.array::<16>()?;

        let trailing = r.remaining();
        if trailing != 0 {
            return Err(EnvelopeError::TrailingBytes(trailing));
        }

        Ok(Self {
            sender_dh_public,
            message_index,
            previous_chain_length,
            prelude,
            ciphertext,
            tag,
        })
    }
}

// ── Cursor ───────────────────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], EnvelopeError> {
        if self.remaining() < n {
            return Err(EnvelopeError::Truncated {
                offset: self.pos,
                needed: n - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], EnvelopeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, EnvelopeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EnvelopeError> {
        Ok(u16::from_be_bytes(self.array::<2>()?))
    }

    fn u32(&mut self) -> Result<u32, EnvelopeError> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }
}
