//! Credit-based flow control between the two pipes.
//!
//! The controller counts messages handed to the destination pipe that have
//! not yet been fully written to its socket. When the count climbs past the
//! high watermark the upstream read side must be plugged; it is unplugged
//! again only once the count has drained below the low watermark, so a
//! destination that is merely slow does not make the agent flap.

/// Unplug upstream reads once pending drops below this.
pub const LO_WATERMARK: usize = 128;
/// Plug upstream reads once pending exceeds this.
pub const HI_WATERMARK: usize = 512;

/// What the caller must do to the upstream pipe after an accounting step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDecision {
    None,
    /// Clear upstream read interest.
    Plug,
    /// Restore upstream read interest.
    Unplug,
}

/// Tracks in-flight sends and the plugged state of the upstream reader.
#[derive(Debug)]
pub struct FlowController {
    pending: usize,
    plugged: bool,
    closed: bool,
    lo: usize,
    hi: usize,
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowController {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_watermarks(LO_WATERMARK, HI_WATERMARK)
    }

    /// Exposed for tuning; the defaults are part of the wire-level contract
    /// with the servers and should be preserved in production use.
    #[must_use]
    pub const fn with_watermarks(lo: usize, hi: usize) -> Self {
        Self {
            pending: 0,
            plugged: false,
            closed: false,
            lo,
            hi,
        }
    }

    #[must_use]
    pub const fn pending(&self) -> usize {
        self.pending
    }

    #[must_use]
    pub const fn is_plugged(&self) -> bool {
        self.plugged
    }

    /// A message was handed to the destination pipe.
    #[must_use]
    pub fn increment(&mut self) -> FlowDecision {
        self.pending += 1;
        if !self.plugged && self.pending > self.hi {
            self.plugged = true;
            return FlowDecision::Plug;
        }
        FlowDecision::None
    }

    /// A message finished draining to the destination socket.
    #[must_use]
    pub fn decrement(&mut self) -> FlowDecision {
        debug_assert!(self.pending > 0, "flow controller underflow");
        self.pending = self.pending.saturating_sub(1);
        if self.plugged && self.pending < self.lo && !self.closed {
            self.plugged = false;
            return FlowDecision::Unplug;
        }
        FlowDecision::None
    }

    /// The upstream has finished; never unplug it again.
    pub fn close(&mut self) {
        self.closed = true;
    }
}
