//! vbmigrate Core
//!
//! This crate contains the protocol-agnostic building blocks of the
//! migration agent:
//! - Error kinds and their sysexits mapping (`error`)
//! - Bucket selector parsing (`buckets`)
//! - `host[:port]` endpoint parsing (`endpoint`)
//! - Credential acquisition (`credentials`)
//! - Hi/lo watermark flow control (`flow`)
//! - The destination backoff side channel (`backoff`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod buckets;
pub mod credentials;
pub mod endpoint;
pub mod error;
pub mod flow;

pub use error::{MigrateError, Result};
