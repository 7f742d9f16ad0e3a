//! SASL authentication handshake.
//!
//! Runs synchronously on a blocking socket before the pipe is handed to the
//! reactor: LIST_MECHS, pick a mechanism, AUTH, then STEP for as long as the
//! server keeps answering AUTH_CONTINUE.
//!
//! `PLAIN` is always available. Credentials cross the wire in cleartext, so
//! the agent is meant to run inside the cluster network, exactly like the
//! servers it talks to.

use std::io::{Read, Write};

use tracing::{debug, warn};
use vbmigrate_core::{MigrateError, Result};

use crate::frame::{opcode, status, Message};
use crate::sync_io::{read_message, write_message};

/// Longest password accepted, in octets.
pub const MAX_PASSWORD_LEN: usize = 127;

trait Mechanism {
    fn name(&self) -> &'static str;
    fn initial(&self, user: &str, password: &str) -> Vec<u8>;
    /// The response to a server challenge, or `None` if the mechanism has no
    /// continuation step.
    fn step(&self, challenge: &[u8]) -> Option<Vec<u8>>;
}

/// `PLAIN` (RFC 4616): `authzid NUL authcid NUL passwd` with an empty
/// authzid, single shot.
struct Plain;

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn initial(&self, user: &str, password: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(user.len() + password.len() + 2);
        out.push(0);
        out.extend_from_slice(user.as_bytes());
        out.push(0);
        out.extend_from_slice(password.as_bytes());
        out
    }

    fn step(&self, _challenge: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

fn select_mechanism(list: &str) -> Option<Box<dyn Mechanism>> {
    // The server advertises a space- or comma-separated list.
    list.split([' ', ','])
        .filter(|name| !name.is_empty())
        .find_map(|name| match name {
            "PLAIN" => Some(Box::new(Plain) as Box<dyn Mechanism>),
            _ => None,
        })
}

fn expect_response(msg: &Message, expected: &[u8]) -> Result<()> {
    if !msg.is_response() || !expected.contains(&msg.opcode()) {
        return Err(MigrateError::protocol(format!(
            "unexpected opcode {:#04x} during authentication",
            msg.opcode()
        )));
    }
    Ok(())
}

/// Authenticate against the server on the other end of `stream`.
///
/// # Errors
///
/// `Auth` when the server rejects the credentials or offers no mechanism we
/// implement, `Protocol` on any deviation from the handshake, `Io` on
/// transport failure.
pub fn authenticate<S: Read + Write>(stream: &mut S, user: &str, password: &str) -> Result<()> {
    if password.len() > MAX_PASSWORD_LEN {
        return Err(MigrateError::Auth(format!(
            "password exceeds {MAX_PASSWORD_LEN} octets"
        )));
    }

    write_message(
        stream,
        &Message::request(opcode::SASL_LIST_MECHS, 0, 0, b"", b"", b""),
    )?;
    let reply = read_message(stream)?;
    expect_response(&reply, &[opcode::SASL_LIST_MECHS])?;
    if reply.status() != status::SUCCESS {
        return Err(MigrateError::protocol(format!(
            "LIST_MECHS failed with status {:#06x}",
            reply.status()
        )));
    }

    let mechs = String::from_utf8_lossy(reply.value()).into_owned();
    let Some(mech) = select_mechanism(&mechs) else {
        return Err(MigrateError::Auth(format!(
            "no supported mechanism offered (server has: {mechs})"
        )));
    };
    debug!(mechanism = mech.name(), user, "authenticating");

    let initial = mech.initial(user, password);
    write_message(
        stream,
        &Message::request(opcode::SASL_AUTH, 0, 0, b"", mech.name().as_bytes(), &initial),
    )?;

    loop {
        let reply = read_message(stream)?;
        expect_response(&reply, &[opcode::SASL_AUTH, opcode::SASL_STEP])?;
        match reply.status() {
            status::SUCCESS => {
                debug!(user, "authenticated");
                return Ok(());
            }
            status::AUTH_CONTINUE => {
                let Some(next) = mech.step(reply.value()) else {
                    return Err(MigrateError::protocol(format!(
                        "server requested a continuation {} does not define",
                        mech.name()
                    )));
                };
                write_message(
                    stream,
                    &Message::request(opcode::SASL_STEP, 0, 0, b"", mech.name().as_bytes(), &next),
                )?;
            }
            status::AUTH_ERROR => {
                let msg = String::from_utf8_lossy(reply.value()).into_owned();
                warn!(user, "authentication rejected: {msg}");
                return Err(MigrateError::Auth(msg));
            }
            other => {
                return Err(MigrateError::protocol(format!(
                    "unexpected status {other:#06x} during authentication"
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    #[test]
    fn plain_initial_response_layout() {
        assert_eq!(Plain.initial("u", "p"), b"\x00u\x00p");
        assert_eq!(Plain.initial("", ""), b"\x00\x00");
    }

    #[test]
    fn mechanism_lists_split_on_space_or_comma() {
        assert!(select_mechanism("CRAM-MD5 PLAIN").is_some());
        assert!(select_mechanism("PLAIN,CRAM-MD5").is_some());
        assert!(select_mechanism("PLAIN").is_some());
        assert!(select_mechanism("CRAM-MD5 SCRAM-SHA-1").is_none());
        assert!(select_mechanism("").is_none());
    }

    #[test]
    fn password_length_is_bounded() {
        let mut dummy = std::io::Cursor::new(Vec::new());
        let long = "x".repeat(MAX_PASSWORD_LEN + 1);
        let err = authenticate(&mut dummy, "user", &long).unwrap_err();
        assert!(matches!(err, MigrateError::Auth(_)));
        // nothing reached the wire
        assert!(dummy.get_ref().is_empty());
    }

    /// Scripted server covering the happy path; asserts the exact AUTH wire
    /// image for user "u", password "p".
    #[test]
    fn plain_handshake_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();

            let req = read_message(&mut peer).unwrap();
            assert_eq!(req.opcode(), opcode::SASL_LIST_MECHS);
            write_message(
                &mut peer,
                &Message::response(opcode::SASL_LIST_MECHS, status::SUCCESS, 0, b"", b"", b"PLAIN"),
            )
            .unwrap();

            let req = read_message(&mut peer).unwrap();
            assert_eq!(req.opcode(), opcode::SASL_AUTH);
            assert_eq!(req.key(), b"PLAIN");
            assert_eq!(req.value(), b"\x00u\x00p");
            write_message(
                &mut peer,
                &Message::response(opcode::SASL_AUTH, status::SUCCESS, 0, b"", b"", b""),
            )
            .unwrap();
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        authenticate(&mut stream, "u", "p").unwrap();
        server.join().unwrap();
    }

    #[test]
    fn boundary_password_is_accepted_on_the_wire() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let password = "p".repeat(MAX_PASSWORD_LEN);
        let expected = password.clone();

        let server = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let _ = read_message(&mut peer).unwrap();
            write_message(
                &mut peer,
                &Message::response(opcode::SASL_LIST_MECHS, status::SUCCESS, 0, b"", b"", b"PLAIN"),
            )
            .unwrap();

            let req = read_message(&mut peer).unwrap();
            assert_eq!(&req.value()[2 + 1..], expected.as_bytes());
            write_message(
                &mut peer,
                &Message::response(opcode::SASL_AUTH, status::SUCCESS, 0, b"", b"", b""),
            )
            .unwrap();
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        authenticate(&mut stream, "u", &password).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn rejection_surfaces_the_server_message() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let _ = read_message(&mut peer).unwrap();
            write_message(
                &mut peer,
                &Message::response(opcode::SASL_LIST_MECHS, status::SUCCESS, 0, b"", b"", b"PLAIN"),
            )
            .unwrap();
            let _ = read_message(&mut peer).unwrap();
            write_message(
                &mut peer,
                &Message::response(
                    opcode::SASL_AUTH,
                    status::AUTH_ERROR,
                    0,
                    b"",
                    b"",
                    b"Auth failure",
                ),
            )
            .unwrap();
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        let err = authenticate(&mut stream, "u", "wrong").unwrap_err();
        match err {
            MigrateError::Auth(msg) => assert_eq!(msg, "Auth failure"),
            other => panic!("unexpected error: {other}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn continue_under_plain_is_a_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let _ = read_message(&mut peer).unwrap();
            write_message(
                &mut peer,
                &Message::response(opcode::SASL_LIST_MECHS, status::SUCCESS, 0, b"", b"", b"PLAIN"),
            )
            .unwrap();
            let _ = read_message(&mut peer).unwrap();
            write_message(
                &mut peer,
                &Message::response(opcode::SASL_AUTH, status::AUTH_CONTINUE, 0, b"", b"", b""),
            )
            .unwrap();
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        let err = authenticate(&mut stream, "u", "p").unwrap_err();
        assert!(matches!(err, MigrateError::Protocol(_)));
        server.join().unwrap();
    }
}
