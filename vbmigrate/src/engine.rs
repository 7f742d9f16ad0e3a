//! The streaming reactor.
//!
//! A single thread owns both pipes, the vbucket filter, the flow controller
//! and the takeover tally. Events flow
//! `source -> upstream pipe -> filter/rewrite -> destination pipe` and
//! destination replies come back the other way; nothing in here is shared
//! with another thread except the slowdown flag (mutex) and the stdin
//! watchdog's wake (atomic + `mio::Waker`).
//!
//! The loop exits when the source has shut down and the destination queue
//! has drained, when a fatal error occurs, when a timer fires, or when
//! stdin closes in erlang-port mode.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Poll, Token, Waker};
use tracing::{debug, info, trace, warn};

use vbmigrate_core::backoff::{BackoffLimits, Slowdown};
use vbmigrate_core::flow::{FlowController, FlowDecision};
use vbmigrate_core::{MigrateError, Result};
use vbmigrate_tap::frame::opcode;
use vbmigrate_tap::tap::{vbucket_set_state, MutationRewrite, VBucketFilter, VBucketState};
use vbmigrate_tap::{Message, MessagePipe, PipeEvent};

const UPSTREAM: Token = Token(0);
const DOWNSTREAM: Token = Token(1);
const WAKER: Token = Token(2);

/// Extra slack, in seconds, the global liveness timer allows on top of the
/// per-pipe timeout before declaring the run dead.
const LIVENESS_SLACK: u32 = 3;

pub struct EngineConfig {
    pub filter: VBucketFilter,
    pub rewrite: MutationRewrite,
    pub takeover: bool,
    /// Per-pipe and liveness timeout in seconds; 0 disables both.
    pub timeout_secs: u32,
    pub backoff: Option<(Slowdown, BackoffLimits)>,
}

/// What a completed run looked like.
#[derive(Debug)]
pub struct EngineReport {
    /// Buckets observed going active on the destination.
    pub moved: usize,
    /// Total `step()` invocations, the liveness currency.
    pub packets: u64,
}

pub struct Engine {
    poll: Poll,
    upstream: MessagePipe,
    downstream: MessagePipe,
    flow: FlowController,
    cfg: EngineConfig,
    moved: usize,
    packets: u64,
    upstream_done: bool,
    port_closed: Arc<AtomicBool>,
    upstream_idle: u32,
    downstream_idle: u32,
}

impl Engine {
    /// Wire two non-blocking, already-authenticated sockets into a reactor.
    pub fn new(source: TcpStream, destination: TcpStream, cfg: EngineConfig) -> Result<Self> {
        let poll = Poll::new()?;
        let mut upstream = MessagePipe::new(source, UPSTREAM, "upstream");
        let mut downstream = MessagePipe::new(destination, DOWNSTREAM, "downstream");
        upstream.register(poll.registry())?;
        downstream.register(poll.registry())?;

        Ok(Self {
            poll,
            upstream,
            downstream,
            flow: FlowController::new(),
            cfg,
            moved: 0,
            packets: 0,
            upstream_done: false,
            port_closed: Arc::new(AtomicBool::new(false)),
            upstream_idle: 0,
            downstream_idle: 0,
        })
    }

    /// Queue a message on the source socket (TAP_CONNECT, forwarded acks).
    pub fn send_upstream(&mut self, msg: Message) -> io::Result<()> {
        self.upstream.send(self.poll.registry(), msg)
    }

    /// The thread-safe loop-break handle used by the stdin watchdog.
    pub fn port_waker(&self) -> io::Result<(Waker, Arc<AtomicBool>)> {
        let waker = Waker::new(self.poll.registry(), WAKER)?;
        Ok((waker, Arc::clone(&self.port_closed)))
    }

    /// Run until the stream completes or dies.
    pub fn run(&mut self) -> Result<EngineReport> {
        match self.event_loop() {
            Ok(()) => {
                if self.flow.pending() != 0 {
                    return Err(MigrateError::software(format!(
                        "{} sends still pending at loop exit",
                        self.flow.pending()
                    )));
                }
                if self.cfg.takeover && self.moved < self.cfg.filter.len() {
                    return Err(MigrateError::software(format!(
                        "only {} of {} buckets moved before the stream ended",
                        self.moved,
                        self.cfg.filter.len()
                    )));
                }
                Ok(EngineReport {
                    moved: self.moved,
                    packets: self.packets,
                })
            }
            Err(err) => {
                self.downstream.abort(self.poll.registry());
                self.upstream.abort(self.poll.registry());
                Err(err)
            }
        }
    }

    /// Tear down, keeping the destination socket open for the state probe.
    /// The upstream socket is released last.
    #[must_use]
    pub fn into_destination(self) -> TcpStream {
        let Engine {
            poll,
            upstream,
            downstream,
            ..
        } = self;
        let stream = downstream.into_inner(poll.registry());
        drop(poll);
        drop(upstream);
        stream
    }

    fn event_loop(&mut self) -> Result<()> {
        let tick = Duration::from_secs(1);
        let mut events = Events::with_capacity(64);
        let mut next_tick = Instant::now() + tick;
        let mut last_packets = self.packets;
        let mut stalled = 0u32;

        loop {
            if let Some((slowdown, limits)) = &self.cfg.backoff {
                if slowdown.is_set() {
                    slowdown.backoff(limits);
                }
            }

            let timeout = next_tick.saturating_duration_since(Instant::now());
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                match event.token() {
                    UPSTREAM => self.pump_upstream(event.is_readable(), event.is_writable())?,
                    DOWNSTREAM => self.pump_downstream(event.is_readable(), event.is_writable())?,
                    WAKER => trace!("woken"),
                    _ => {}
                }
            }

            if self.port_closed.load(Ordering::SeqCst) {
                info!("standard input closed, leaving");
                return Err(MigrateError::PortClosed);
            }

            if self.upstream_done && self.downstream.is_drained() {
                debug!(packets = self.packets, "stream complete");
                return Ok(());
            }

            if Instant::now() >= next_tick {
                next_tick += tick;
                self.on_tick(&mut last_packets, &mut stalled)?;
            }
        }
    }

    /// Once-per-second bookkeeping: the per-pipe idle watchdogs plus the
    /// packet-counter liveness backstop.
    fn on_tick(&mut self, last_packets: &mut u64, stalled: &mut u32) -> Result<()> {
        let timeout = self.cfg.timeout_secs;
        if timeout == 0 {
            return Ok(());
        }

        if self.upstream.is_armed() {
            self.upstream_idle += 1;
            if self.upstream_idle >= timeout {
                return Err(MigrateError::Timeout(format!(
                    "source socket idle for {} seconds",
                    self.upstream_idle
                )));
            }
        } else {
            self.upstream_idle = 0;
        }

        // The destination is allowed to stay silent; its watchdog only arms
        // while output is pending on it.
        if !self.downstream.is_drained() {
            self.downstream_idle += 1;
            if self.downstream_idle >= timeout {
                return Err(MigrateError::Timeout(format!(
                    "destination socket idle for {} seconds with {} messages queued",
                    self.downstream_idle,
                    self.downstream.queue_len()
                )));
            }
        } else {
            self.downstream_idle = 0;
        }

        if self.packets == *last_packets {
            *stalled += 1;
            if *stalled >= timeout + LIVENESS_SLACK {
                return Err(MigrateError::Timeout(format!(
                    "no packet activity for {stalled} seconds"
                )));
            }
        } else {
            *last_packets = self.packets;
            *stalled = 0;
        }

        Ok(())
    }

    fn pump_upstream(&mut self, readable: bool, writable: bool) -> Result<()> {
        let (events, activity) = self
            .upstream
            .step(self.poll.registry(), readable, writable)?;
        self.packets += 1;
        if activity {
            self.upstream_idle = 0;
        }

        for event in events {
            match event {
                PipeEvent::Received(msg) => self.forward_downstream(msg)?,
                PipeEvent::Sent(msg) => trace!("sent to source: {msg}"),
                PipeEvent::Shutdown => {
                    info!(
                        queued = self.downstream.queue_len(),
                        pending = self.flow.pending(),
                        "source finished, draining"
                    );
                    self.upstream_done = true;
                    self.flow.close();
                    self.downstream.plug_input(self.poll.registry())?;
                }
            }
        }
        Ok(())
    }

    fn pump_downstream(&mut self, readable: bool, writable: bool) -> Result<()> {
        let (events, activity) = self
            .downstream
            .step(self.poll.registry(), readable, writable)?;
        self.packets += 1;
        if activity {
            self.downstream_idle = 0;
        }

        for event in events {
            match event {
                PipeEvent::Received(msg) => {
                    // TAP acks and error responses go back to the source;
                    // NOOP replies are connection chatter and stop here.
                    if msg.opcode() == opcode::NOOP {
                        continue;
                    }
                    if self.upstream.is_closed() {
                        trace!("dropping response after source close: {msg}");
                    } else {
                        self.upstream.send(self.poll.registry(), msg)?;
                    }
                }
                PipeEvent::Sent(msg) => self.account_downstream_send(&msg)?,
                PipeEvent::Shutdown => {
                    if self.upstream_done && self.downstream.is_drained() {
                        debug!("destination closed after drain");
                    } else {
                        return Err(MigrateError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "destination closed the connection mid-stream",
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Filter, rewrite and hand one source message to the destination.
    fn forward_downstream(&mut self, mut msg: Message) -> Result<()> {
        if msg.opcode() == opcode::NOOP {
            return Ok(());
        }
        if !self.cfg.filter.passes(&msg) {
            warn!("Internal error: received a message for a bucket I didn't request: {msg}");
            return Ok(());
        }
        if !self.cfg.rewrite.is_empty() {
            self.cfg.rewrite.apply(&mut msg);
        }

        if self.flow.increment() == FlowDecision::Plug {
            debug!(
                pending = self.flow.pending(),
                "backpressure: plugging upstream reads"
            );
            self.upstream.plug_input(self.poll.registry())?;
        }
        self.downstream.send(self.poll.registry(), msg)?;
        Ok(())
    }

    /// A frame finished draining to the destination: release its flow
    /// credit and watch for takeover transitions.
    fn account_downstream_send(&mut self, msg: &Message) -> Result<()> {
        if self.flow.decrement() == FlowDecision::Unplug {
            debug!(
                pending = self.flow.pending(),
                "backpressure: unplugging upstream reads"
            );
            self.upstream.unplug_input(self.poll.registry())?;
        }

        if msg.opcode() == opcode::TAP_VBUCKET_SET {
            match vbucket_set_state(msg) {
                Ok(VBucketState::Pending) => {
                    println!("Starting to move bucket {}", msg.vbucket());
                    io::stdout().flush()?;
                }
                Ok(VBucketState::Active) => {
                    self.moved += 1;
                    println!("Bucket {} moved to the next server", msg.vbucket());
                    io::stdout().flush()?;
                }
                Ok(state) => {
                    debug!(vbucket = msg.vbucket(), ?state, "vbucket state change");
                }
                Err(raw) => {
                    warn!(
                        vbucket = msg.vbucket(),
                        raw, "invalid state in TAP_VBUCKET_SET"
                    );
                }
            }
        }
        Ok(())
    }
}
