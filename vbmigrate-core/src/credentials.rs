//! Credential acquisition for `-a`.
//!
//! The username comes from the command line; the password is prompted for on
//! the controlling terminal when stdin is one, otherwise a single line is
//! consumed from stdin (so an orchestrator can feed it through a pipe).

use std::io::{self, BufRead, IsTerminal, Write};

/// Read the password for `user`.
///
/// Trailing CR/LF is stripped in both modes.
///
/// # Errors
///
/// Returns the underlying I/O error, or `UnexpectedEof` if stdin closes
/// before a line arrives.
pub fn read_password(user: &str) -> io::Result<String> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        let mut err = io::stderr();
        write!(err, "Enter password for {user}: ")?;
        err.flush()?;
    }

    let mut line = String::new();
    if stdin.lock().read_line(&mut line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "no password on standard input",
        ));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}
