//! Pipe behavior against real sockets: partial reads, partial writes,
//! interest toggling and fatal frames.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream as StdTcpStream};
use std::thread;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token};
use vbmigrate_core::MigrateError;
use vbmigrate_tap::frame::{magic, opcode, Message, HEADER_LEN, MAX_FRAME};
use vbmigrate_tap::{MessagePipe, PipeEvent};

const PIPE: Token = Token(0);

fn mio_connect(addr: SocketAddr) -> mio::net::TcpStream {
    let stream = StdTcpStream::connect(addr).unwrap();
    stream.set_nonblocking(true).unwrap();
    mio::net::TcpStream::from_std(stream)
}

struct Harness {
    poll: Poll,
    pipe: MessagePipe,
}

impl Harness {
    fn connect(addr: SocketAddr) -> Self {
        let poll = Poll::new().unwrap();
        let mut pipe = MessagePipe::new(mio_connect(addr), PIPE, "test");
        pipe.register(poll.registry()).unwrap();
        Self { poll, pipe }
    }

    /// Pump the pipe until `want` events have been collected or the
    /// deadline passes.
    fn drive_until(
        &mut self,
        want: usize,
        deadline: Duration,
    ) -> Result<Vec<PipeEvent>, MigrateError> {
        let mut out = Vec::new();
        let mut events = Events::with_capacity(8);
        let end = Instant::now() + deadline;
        while out.len() < want && Instant::now() < end {
            self.poll
                .poll(&mut events, Some(Duration::from_millis(20)))
                .unwrap();
            for ev in events.iter() {
                let (evs, _) = self.pipe.step(
                    self.poll.registry(),
                    ev.is_readable(),
                    ev.is_writable(),
                )?;
                out.extend(evs);
            }
        }
        Ok(out)
    }
}

#[test]
fn header_arriving_byte_by_byte_yields_one_message() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();
        // a body-less frame, trickled one byte at a time
        let noop = Message::request(opcode::NOOP, 0, 7, b"", b"", b"");
        for byte in noop.as_bytes() {
            peer.write_all(&[*byte]).unwrap();
            peer.flush().unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        // then a regular frame with a body, in one burst
        let mutation = Message::request(opcode::TAP_MUTATION, 9, 8, &[0u8; 16], b"key", b"val");
        peer.write_all(mutation.as_bytes()).unwrap();
        thread::sleep(Duration::from_millis(50));
    });

    let mut h = Harness::connect(addr);
    let events = h.drive_until(2, Duration::from_secs(5)).unwrap();

    let received: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PipeEvent::Received(msg) => Some((msg.opcode(), msg.vbucket(), msg.opaque())),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![(opcode::NOOP, 0, 7), (opcode::TAP_MUTATION, 9, 8)]);
    server.join().unwrap();
}

#[test]
fn oversize_frame_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();
        let mut header = [0u8; HEADER_LEN];
        header[0] = magic::REQUEST;
        header[1] = opcode::TAP_MUTATION;
        header[8..12].copy_from_slice(&((MAX_FRAME as u32) + 1).to_be_bytes());
        peer.write_all(&header).unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let mut h = Harness::connect(addr);
    let err = h.drive_until(1, Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, MigrateError::FrameTooLarge { .. }));
    server.join().unwrap();
}

#[test]
fn bad_magic_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();
        peer.write_all(&[0x42; HEADER_LEN]).unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let mut h = Harness::connect(addr);
    let err = h.drive_until(1, Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, MigrateError::Protocol(_)));
    server.join().unwrap();
}

#[test]
fn partial_writes_resume_until_the_frame_is_sent() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let payload = vec![0xabu8; 1024 * 1024];
    let expected_len = HEADER_LEN + 16 + 3 + payload.len();

    let server = thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();
        // read slowly so the sender hits WouldBlock and has to resume
        let mut got = Vec::new();
        let mut chunk = [0u8; 16 * 1024];
        loop {
            match peer.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    got.extend_from_slice(&chunk[..n]);
                    thread::sleep(Duration::from_millis(2));
                }
                Err(_) => break,
            }
        }
        got
    });

    let mut h = Harness::connect(addr);
    let msg = Message::request(opcode::TAP_MUTATION, 3, 0, &[0u8; 16], b"big", &payload);
    h.pipe.send(h.poll.registry(), msg).unwrap();

    let events = h.drive_until(1, Duration::from_secs(10)).unwrap();
    assert!(matches!(events[0], PipeEvent::Sent(_)));
    assert!(h.pipe.is_drained());

    drop(h); // close our end so the server sees EOF
    let got = server.join().unwrap();
    assert_eq!(got.len(), expected_len);
    assert_eq!(got[1], opcode::TAP_MUTATION);
}

#[test]
fn eof_emits_shutdown_and_disarms() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (peer, _) = listener.accept().unwrap();
        drop(peer);
    });

    let mut h = Harness::connect(addr);
    let events = h.drive_until(1, Duration::from_secs(5)).unwrap();
    assert!(matches!(events[0], PipeEvent::Shutdown));
    assert!(h.pipe.is_closed());
    assert!(!h.pipe.is_armed());
    server.join().unwrap();
}

#[test]
fn plugged_input_defers_delivery_until_unplug() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();
        let msg = Message::request(opcode::TAP_MUTATION, 5, 0, &[0u8; 16], b"k", b"v");
        peer.write_all(msg.as_bytes()).unwrap();
        thread::sleep(Duration::from_millis(300));
    });

    let mut h = Harness::connect(addr);
    h.pipe.plug_input(h.poll.registry()).unwrap();
    assert!(h.pipe.is_input_plugged());

    let events = h.drive_until(1, Duration::from_millis(150)).unwrap();
    assert!(events.is_empty(), "plugged pipe delivered {events:?}");

    h.pipe.unplug_input(h.poll.registry()).unwrap();
    let events = h.drive_until(1, Duration::from_secs(5)).unwrap();
    assert!(
        matches!(&events[0], PipeEvent::Received(msg) if msg.vbucket() == 5),
        "expected the deferred frame, got {events:?}"
    );
    server.join().unwrap();
}
