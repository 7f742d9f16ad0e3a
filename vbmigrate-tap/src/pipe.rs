//! Non-blocking message pipe.
//!
//! One pipe per socket. Inbound bytes are assembled through a two-phase
//! state machine (fixed header slot, then an exact-size body buffer);
//! outbound messages wait in a FIFO whose front carries a byte cursor, so a
//! partially written frame survives `WouldBlock` intact.
//!
//! The pipe never decides policy: `step` returns the events produced by one
//! readiness notification and the reactor routes them. Read interest can be
//! plugged and unplugged without touching the queue, which is how the flow
//! controller pushes backpressure onto the source.
//!
//! Interest registration is recomputed after every mutation:
//! `READABLE` iff input is unplugged and the pipe is open, `WRITABLE` iff
//! the queue is non-empty and the pipe is open. A closed pipe is
//! deregistered for good.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace};
use vbmigrate_core::{MigrateError, Result};

use crate::frame::{Message, HEADER_LEN};

/// What one readiness notification produced.
#[derive(Debug)]
pub enum PipeEvent {
    /// A complete frame arrived.
    Received(Message),
    /// A queued frame was fully written to the socket.
    Sent(Message),
    /// The peer closed its end of the stream.
    Shutdown,
}

enum RxState {
    Header { buf: [u8; HEADER_LEN], have: usize },
    Body { msg: Message, have: usize },
}

impl RxState {
    const fn empty() -> Self {
        Self::Header {
            buf: [0; HEADER_LEN],
            have: 0,
        }
    }
}

pub struct MessagePipe {
    stream: TcpStream,
    token: Token,
    label: &'static str,
    rx: RxState,
    queue: VecDeque<Message>,
    /// Bytes of the queue front already written.
    sent: usize,
    do_read: bool,
    closed: bool,
    /// Interest currently registered with the poller, if any.
    registered: Option<Interest>,
}

impl MessagePipe {
    #[must_use]
    pub fn new(stream: TcpStream, token: Token, label: &'static str) -> Self {
        Self {
            stream,
            token,
            label,
            rx: RxState::empty(),
            queue: VecDeque::new(),
            sent: 0,
            do_read: true,
            closed: false,
            registered: None,
        }
    }

    #[must_use]
    pub const fn token(&self) -> Token {
        self.token
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the outbound queue has fully drained.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub const fn is_input_plugged(&self) -> bool {
        !self.do_read
    }

    /// Whether the pipe currently has any interest registered.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.registered.is_some()
    }

    /// Register with the poller according to the current state. Call once
    /// after construction.
    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        self.update_interest(registry)
    }

    /// Enqueue a message for transmission, taking ownership. Messages queued
    /// after the pipe closed are dropped.
    pub fn send(&mut self, registry: &Registry, msg: Message) -> io::Result<()> {
        if self.closed {
            debug!("{}: dropping message queued after close: {}", self.label, msg);
            return Ok(());
        }
        self.queue.push_back(msg);
        self.update_interest(registry)
    }

    /// Clear read interest without touching the queue.
    pub fn plug_input(&mut self, registry: &Registry) -> io::Result<()> {
        if self.do_read {
            trace!("{}: input plugged", self.label);
            self.do_read = false;
            self.update_interest(registry)?;
        }
        Ok(())
    }

    /// Restore read interest.
    pub fn unplug_input(&mut self, registry: &Registry) -> io::Result<()> {
        if !self.do_read {
            trace!("{}: input unplugged", self.label);
            self.do_read = true;
            self.update_interest(registry)?;
        }
        Ok(())
    }

    /// Drive the pipe after a readiness notification. Returns the events
    /// produced and whether any bytes moved in either direction.
    pub fn step(
        &mut self,
        registry: &Registry,
        readable: bool,
        writable: bool,
    ) -> Result<(Vec<PipeEvent>, bool)> {
        let mut events = Vec::new();
        let mut activity = false;

        if writable && !self.closed {
            self.drain_queue(&mut events, &mut activity)?;
        }
        if readable && self.do_read && !self.closed {
            self.fill(&mut events, &mut activity)?;
        }

        self.update_interest(registry)?;
        Ok((events, activity))
    }

    /// Tear the pipe down: deregister, shut the socket, discard the queue.
    /// Idempotent; no further events are produced.
    pub fn abort(&mut self, registry: &Registry) {
        if self.registered.take().is_some() {
            let _ = registry.deregister(&mut self.stream);
        }
        if !self.closed {
            debug!("{}: aborted with {} queued messages", self.label, self.queue.len());
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
            self.closed = true;
        }
        self.queue.clear();
        self.sent = 0;
    }

    /// Deregister and hand the socket back, leaving it open.
    pub fn into_inner(mut self, registry: &Registry) -> TcpStream {
        if self.registered.take().is_some() {
            let _ = registry.deregister(&mut self.stream);
        }
        self.stream
    }

    /// Write as much of the queue as the socket accepts.
    fn drain_queue(&mut self, events: &mut Vec<PipeEvent>, activity: &mut bool) -> Result<()> {
        while let Some(front) = self.queue.front() {
            let remaining = &front.as_bytes()[self.sent..];
            match self.stream.write(remaining) {
                Ok(0) => {
                    return Err(MigrateError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    )));
                }
                Ok(n) => {
                    *activity = true;
                    self.sent += n;
                    if self.sent == front.as_bytes().len() {
                        let msg = self.queue.pop_front().expect("front checked above");
                        self.sent = 0;
                        events.push(PipeEvent::Sent(msg));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Assemble and emit as many complete frames as the socket yields.
    fn fill(&mut self, events: &mut Vec<PipeEvent>, activity: &mut bool) -> Result<()> {
        loop {
            match &mut self.rx {
                RxState::Header { buf, have } => match self.stream.read(&mut buf[*have..]) {
                    Ok(0) => {
                        debug!("{}: peer closed the stream", self.label);
                        self.closed = true;
                        events.push(PipeEvent::Shutdown);
                        return Ok(());
                    }
                    Ok(n) => {
                        *activity = true;
                        *have += n;
                        if *have == HEADER_LEN {
                            let msg = Message::from_wire_header(buf)?;
                            if msg.bodylen() == 0 {
                                events.push(PipeEvent::Received(msg));
                                self.rx = RxState::empty();
                            } else {
                                self.rx = RxState::Body { msg, have: 0 };
                            }
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                },

                RxState::Body { msg, have } => {
                    let start = HEADER_LEN + *have;
                    match self.stream.read(&mut msg.data_mut()[start..]) {
                        Ok(0) => {
                            // EOF mid-frame; the partial message is dropped.
                            debug!("{}: peer closed the stream mid-frame", self.label);
                            self.closed = true;
                            events.push(PipeEvent::Shutdown);
                            return Ok(());
                        }
                        Ok(n) => {
                            *activity = true;
                            *have += n;
                            if *have == msg.bodylen() {
                                let RxState::Body { msg, .. } =
                                    std::mem::replace(&mut self.rx, RxState::empty())
                                else {
                                    unreachable!("matched Body above");
                                };
                                events.push(PipeEvent::Received(msg));
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    fn desired_interest(&self) -> Option<Interest> {
        if self.closed {
            return None;
        }
        let mut want: Option<Interest> = None;
        if self.do_read {
            want = Some(Interest::READABLE);
        }
        if !self.queue.is_empty() {
            want = Some(match want {
                Some(interest) => interest | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        want
    }

    fn update_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let want = self.desired_interest();
        if want == self.registered {
            return Ok(());
        }
        match (self.registered, want) {
            (None, Some(interest)) => registry.register(&mut self.stream, self.token, interest)?,
            (Some(_), Some(interest)) => {
                registry.reregister(&mut self.stream, self.token, interest)?;
            }
            (Some(_), None) => registry.deregister(&mut self.stream)?,
            (None, None) => {}
        }
        self.registered = want;
        Ok(())
    }
}
