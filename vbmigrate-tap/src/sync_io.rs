//! Blocking-mode I/O for the synchronous sub-protocols.
//!
//! Authentication runs before a socket is handed to the reactor and the
//! post-takeover state probe runs after the reactor has finished, so both
//! use plain blocking reads and writes guarded by socket-level send/receive
//! timeouts instead of going through the event loop.

use std::io::{self, Read, Write};
use std::time::Duration;

use socket2::SockRef;
use vbmigrate_core::Result;

use crate::frame::{Message, HEADER_LEN};

/// Write a full frame.
pub fn write_message(stream: &mut impl Write, msg: &Message) -> io::Result<()> {
    stream.write_all(msg.as_bytes())?;
    stream.flush()
}

/// Read a full frame: the fixed header, then exactly the advertised body.
pub fn read_message(stream: &mut impl Read) -> Result<Message> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header)?;
    let mut msg = Message::from_wire_header(&header)?;
    if msg.bodylen() > 0 {
        stream.read_exact(&mut msg.data_mut()[HEADER_LEN..])?;
    }
    Ok(msg)
}

/// Put a socket into blocking mode with `SO_SNDTIMEO`/`SO_RCVTIMEO` applied,
/// so a synchronous round-trip cannot hang forever.
pub fn prepare_sync(stream: &std::net::TcpStream, timeout: Option<Duration>) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_nonblocking(false)?;
    sock.set_read_timeout(timeout)?;
    sock.set_write_timeout(timeout)?;
    Ok(())
}

/// Put a socket into non-blocking mode for the reactor; any lingering
/// blocking-mode timeouts are cleared.
pub fn prepare_async(stream: &std::net::TcpStream) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_read_timeout(None)?;
    sock.set_write_timeout(None)?;
    sock.set_nonblocking(true)?;
    Ok(())
}

/// Recover the plain socket from a mio stream once the reactor is done with
/// it. The caller owns the reactivation via [`prepare_sync`].
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn into_std(stream: mio::net::TcpStream) -> std::net::TcpStream {
    use std::os::fd::{FromRawFd, IntoRawFd};
    unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) }
}

#[cfg(windows)]
#[allow(unsafe_code)]
pub fn into_std(stream: mio::net::TcpStream) -> std::net::TcpStream {
    use std::os::windows::io::{FromRawSocket, IntoRawSocket};
    unsafe { std::net::TcpStream::from_raw_socket(stream.into_raw_socket()) }
}
