//! # vbmigrate
//!
//! A vbucket migration agent for memcached/membase clusters: opens a TAP
//! stream on a source server, filters it to a set of vbuckets, and replays
//! every message to a destination server. In takeover mode it watches the
//! embedded state transitions and reports each vbucket that goes active on
//! the destination.
//!
//! The crate splits into the reactor ([`engine`]), the argument surface
//! ([`cli`]) and the erlang-port stdin watchdog ([`watchdog`]); the wire
//! protocol lives in `vbmigrate-tap` and the generic plumbing in
//! `vbmigrate-core`.

pub mod cli;
pub mod engine;
pub mod watchdog;
