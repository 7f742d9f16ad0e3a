//! TAP stream specifics: the connect request, per-message rewrites, vbucket
//! state transitions and the vbucket filter.

use bytes::{BufMut, BytesMut};

use crate::frame::{opcode, Message, HEADER_LEN};

/// Opaque stamped on the TAP_CONNECT request.
pub const TAP_CONNECT_OPAQUE: u32 = 0xcafe_cafe;

pub mod connect_flags {
    pub const LIST_VBUCKETS: u32 = 0x04;
    pub const TAKEOVER_VBUCKETS: u32 = 0x08;
    pub const SUPPORT_ACK: u32 = 0x10;
    pub const REGISTERED_CLIENT: u32 = 0x80;
}

/// Offsets inside TAP_MUTATION extras: an 8-byte engine header (private
/// length, tap flags, ttl, 3 reserved bytes) followed by the item flags and
/// item expiry.
const MUTATION_FLAGS_OFFSET: usize = 8;
const MUTATION_EXPIRY_OFFSET: usize = 12;
const MUTATION_EXTRAS_LEN: usize = 16;

/// The TAP_CONNECT request sent to the source before streaming starts.
#[derive(Debug, Clone, Default)]
pub struct TapConnect {
    pub buckets: Vec<u16>,
    pub takeover: bool,
    pub support_ack: bool,
    pub registered: bool,
    pub name: Option<String>,
}

impl TapConnect {
    /// Encode the request: extras carry the flags, the key carries the
    /// stream name, and the value is a bucket count followed by the ids.
    #[must_use]
    pub fn build(&self) -> Message {
        let mut flags = connect_flags::LIST_VBUCKETS;
        if self.takeover {
            flags |= connect_flags::TAKEOVER_VBUCKETS;
        }
        if self.support_ack {
            flags |= connect_flags::SUPPORT_ACK;
        }
        if self.registered {
            flags |= connect_flags::REGISTERED_CLIENT;
        }

        let mut value = BytesMut::with_capacity(2 + self.buckets.len() * 2);
        value.put_u16(self.buckets.len() as u16);
        for id in &self.buckets {
            value.put_u16(*id);
        }

        let key = self.name.as_deref().unwrap_or("");
        Message::request(
            opcode::TAP_CONNECT,
            0,
            TAP_CONNECT_OPAQUE,
            &flags.to_be_bytes(),
            key.as_bytes(),
            &value,
        )
    }
}

/// vbucket states carried by TAP_VBUCKET_SET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBucketState {
    Active,
    Replica,
    Pending,
    Dead,
}

impl VBucketState {
    #[must_use]
    pub const fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Active),
            2 => Some(Self::Replica),
            3 => Some(Self::Pending),
            4 => Some(Self::Dead),
            _ => None,
        }
    }
}

/// Decode the 4-byte network-order state at the start of a TAP_VBUCKET_SET
/// value. `Err` carries the raw word for logging; a truncated value decodes
/// as raw 0.
pub fn vbucket_set_state(msg: &Message) -> Result<VBucketState, u32> {
    let value = msg.value();
    if value.len() < 4 {
        return Err(0);
    }
    let raw = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
    VBucketState::from_wire(raw).ok_or(raw)
}

/// Expiry/flags overrides applied to replayed mutations (`-E` / `-f`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationRewrite {
    pub expiry: Option<u32>,
    pub flags: Option<u32>,
}

impl MutationRewrite {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.expiry.is_none() && self.flags.is_none()
    }

    /// Rewrite the item flags and expiry inside a TAP_MUTATION's extras, in
    /// place. Frames with short extras are left untouched.
    pub fn apply(&self, msg: &mut Message) {
        if msg.opcode() != opcode::TAP_MUTATION || msg.extlen() < MUTATION_EXTRAS_LEN {
            return;
        }
        let data = msg.data_mut();
        if let Some(flags) = self.flags {
            let off = HEADER_LEN + MUTATION_FLAGS_OFFSET;
            data[off..off + 4].copy_from_slice(&flags.to_be_bytes());
        }
        if let Some(expiry) = self.expiry {
            let off = HEADER_LEN + MUTATION_EXPIRY_OFFSET;
            data[off..off + 4].copy_from_slice(&expiry.to_be_bytes());
        }
    }
}

/// The set of vbuckets this run is migrating.
///
/// Connection-scoped opcodes (NOOP, TAP_OPAQUE) bypass the filter; anything
/// else must carry one of the configured ids.
#[derive(Debug, Clone)]
pub struct VBucketFilter {
    ids: Vec<u16>,
}

impl VBucketFilter {
    #[must_use]
    pub fn new(mut ids: Vec<u16>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self { ids }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn ids(&self) -> &[u16] {
        &self.ids
    }

    #[must_use]
    pub fn contains(&self, id: u16) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Whether a message from the source may be forwarded downstream.
    #[must_use]
    pub fn passes(&self, msg: &Message) -> bool {
        matches!(msg.opcode(), opcode::NOOP | opcode::TAP_OPAQUE) || self.contains(msg.vbucket())
    }
}
