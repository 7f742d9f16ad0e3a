//! Stdin watchdog for erlang port mode.
//!
//! The supervising VM signals shutdown by closing our stdin. A detached
//! thread consumes stdin byte by byte until EOF, then flags the reactor and
//! wakes it through its `Waker`. It touches nothing on the data path.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use mio::Waker;
use tracing::debug;

pub fn spawn(waker: Waker, closed: Arc<AtomicBool>) -> std::io::Result<()> {
    thread::Builder::new()
        .name("stdin-watchdog".into())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut byte = [0u8; 1];
            loop {
                match stdin.read(&mut byte) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
            debug!("stdin reached EOF");
            closed.store(true, Ordering::SeqCst);
            let _ = waker.wake();
        })?;
    Ok(())
}
