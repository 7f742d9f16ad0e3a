//! Synchronous GET_VBUCKET state probe.
//!
//! Used after a takeover to confirm that each migrated vbucket is active on
//! the destination. Requests always go out as opcode 0x3b; responses arrive
//! as 0x3b or 0x84 depending on the server generation, and both are
//! accepted.

use std::io::{Read, Write};

use tracing::debug;
use vbmigrate_core::{MigrateError, Result};

use crate::frame::{opcode, status, Message};
use crate::sync_io::{read_message, write_message};
use crate::tap::VBucketState;

/// One GET_VBUCKET round-trip on a blocking socket.
///
/// # Errors
///
/// `Protocol` on an unexpected opcode, a non-success status or an
/// undecodable state; `Io` on transport failure (including the socket
/// timeouts installed by [`crate::sync_io::prepare_sync`]).
pub fn get_vbucket_state<S: Read + Write>(stream: &mut S, vbucket: u16) -> Result<VBucketState> {
    write_message(
        stream,
        &Message::request(opcode::GET_VBUCKET, vbucket, 0, b"", b"", b""),
    )?;

    let reply = read_message(stream)?;
    if !reply.is_response()
        || !matches!(reply.opcode(), opcode::GET_VBUCKET | opcode::GET_VBUCKET_ALT)
    {
        return Err(MigrateError::protocol(format!(
            "unexpected reply to GET_VBUCKET (opcode {:#04x})",
            reply.opcode()
        )));
    }
    if reply.status() != status::SUCCESS {
        return Err(MigrateError::protocol(format!(
            "GET_VBUCKET({vbucket}) failed with status {:#06x}",
            reply.status()
        )));
    }

    let value = reply.value();
    if value.len() < 4 {
        return Err(MigrateError::protocol("short GET_VBUCKET response"));
    }
    let raw = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
    let state = VBucketState::from_wire(raw)
        .ok_or_else(|| MigrateError::protocol(format!("invalid vbucket state {raw}")))?;
    debug!(vbucket, ?state, "probed");
    Ok(state)
}
