//! # vbmigrate TAP
//!
//! Memcached binary protocol plumbing for the migration agent: the 24-byte
//! frame codec, the TAP request builders, the synchronous SASL and
//! GET_VBUCKET sub-protocols, and the non-blocking message pipe that frames
//! an asynchronous TAP firehose over a `mio` socket.
//!
//! The pipe is readiness-driven and emits events instead of calling back
//! into its owner, so the reactor decides how each side of the proxy reacts:
//!
//! ```rust,ignore
//! let (events, _activity) = pipe.step(registry, readable, writable)?;
//! for event in events {
//!     match event {
//!         PipeEvent::Received(msg) => { /* filter, rewrite, forward */ }
//!         PipeEvent::Sent(msg) => { /* accounting, takeover tally */ }
//!         PipeEvent::Shutdown => { /* drain and leave */ }
//!     }
//! }
//! ```

#![deny(unsafe_code)]
// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod frame;
pub mod pipe;
pub mod probe;
pub mod sasl;
pub mod sync_io;
pub mod tap;

pub use frame::{Message, HEADER_LEN, MAX_FRAME};
pub use pipe::{MessagePipe, PipeEvent};
pub use tap::{TapConnect, VBucketFilter, VBucketState};
