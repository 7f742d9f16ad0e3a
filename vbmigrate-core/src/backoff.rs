//! Destination backoff side channel.
//!
//! A monitor thread polls the destination's disk-queue statistics over a
//! plain ASCII `stats` connection once per second. When the dirty count
//! (`ep_queue_size` + `ep_flusher_todo`) climbs past the configured
//! threshold a process-wide slowdown flag is raised; the streaming loop
//! consults [`Slowdown::backoff`] to pace itself until the queue drains.
//! After tripping, the monitor re-arms at a third of the threshold so the
//! destination gets room to drain before the stream ramps up again.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::endpoint::HostPort;
use crate::error::{exit_code, MigrateError, Result};

/// Longest single backoff sleep, in microseconds.
const MAX_DELAY_US: u64 = 10_000;

/// `-M delay,threshold` parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffLimits {
    /// Initial sleep in microseconds; doubled on every iteration the flag
    /// stays up, capped at [`MAX_DELAY_US`].
    pub delay_us: u64,
    /// Dirty count above which the slowdown flag is raised.
    pub threshold: i64,
}

impl Default for BackoffLimits {
    fn default() -> Self {
        Self {
            delay_us: 500,
            threshold: 100_000,
        }
    }
}

impl BackoffLimits {
    /// Parse `delay,threshold`; either side may be `-` to keep its default.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Usage` on missing separator, unparseable or
    /// zero values.
    pub fn parse(spec: &str) -> Result<Self> {
        let Some((delay, threshold)) = spec.split_once(',') else {
            return Err(MigrateError::usage(
                "You need to specify both parameters to -M",
            ));
        };

        let mut limits = Self::default();
        if delay != "-" {
            limits.delay_us = delay
                .parse()
                .map_err(|_| MigrateError::usage(format!("Invalid -M delay: {delay}")))?;
        }
        if threshold != "-" {
            limits.threshold = threshold
                .parse()
                .map_err(|_| MigrateError::usage(format!("Invalid -M threshold: {threshold}")))?;
        }

        if limits.delay_us == 0 || limits.threshold == 0 {
            return Err(MigrateError::usage("Invalid values specified for -M"));
        }
        Ok(limits)
    }
}

/// Process-wide slowdown flag shared between the monitor thread and the
/// streaming loop. Cheap to clone; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct Slowdown {
    flag: Arc<Mutex<bool>>,
}

impl Slowdown {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: bool) {
        *self.flag.lock() = value;
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// Sleep while the flag is raised, doubling the delay each round.
    pub fn backoff(&self, limits: &BackoffLimits) {
        let mut delay = limits.delay_us;
        while self.is_set() {
            debug!(delay_us = delay, "backing off");
            thread::sleep(Duration::from_micros(delay));
            delay = (delay << 1).min(MAX_DELAY_US);
        }
    }
}

fn dirty_count(reader: &mut impl BufRead) -> std::io::Result<i64> {
    let mut dirty = 0;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stats stream closed",
            ));
        }
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next(), fields.next()) {
            (Some("END"), ..) => return Ok(dirty),
            (Some("STAT"), Some("ep_queue_size" | "ep_flusher_todo"), Some(value)) => {
                dirty += value.parse::<i64>().unwrap_or(0);
            }
            _ => {}
        }
    }
}

fn monitor_loop(stream: TcpStream, limits: BackoffLimits, slowdown: &Slowdown) -> Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut armed_at = limits.threshold;

    loop {
        writer.write_all(b"stats\r\n")?;
        writer.flush()?;

        let dirty = dirty_count(&mut reader)?;
        let tripped = dirty > armed_at;
        slowdown.set(tripped);
        // Once tripped, let the queue drain well below the threshold before
        // letting the stream back up.
        armed_at = if tripped {
            limits.threshold / 3
        } else {
            limits.threshold
        };
        debug!(dirty, tripped, "destination queue probed");

        thread::sleep(Duration::from_secs(1));
    }
}

/// Connect the stats side channel and start the detached monitor thread.
///
/// A monitor that loses its connection mid-run takes the process down with
/// an I/O exit code, matching the contract the orchestrator expects.
///
/// # Errors
///
/// Returns the connect error; failures after the thread has started are
/// fatal to the process.
pub fn start_monitor(endpoint: &HostPort, limits: BackoffLimits, slowdown: Slowdown) -> Result<()> {
    info!(%endpoint, ?limits, "connecting backoff monitor");
    let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))?;

    thread::Builder::new()
        .name("backoff-monitor".into())
        .spawn(move || {
            if let Err(e) = monitor_loop(stream, limits, &slowdown) {
                error!("backoff monitor failed: {e}");
                std::process::exit(exit_code::IOERR);
            }
        })?;
    Ok(())
}
