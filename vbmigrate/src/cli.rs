//! Command line surface.
//!
//! The move orchestrator drives this program repeatedly and scrapes its
//! output, so the short flag names are stable. `-h` means "host" here; help
//! hangs off `--help` instead.

use clap::{ArgAction, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "vbmigrate",
    version,
    about = "Migrate vbuckets by replaying a TAP stream from one server to another",
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct Cli {
    /// Source server to stream from
    #[arg(short = 'h', value_name = "host:port")]
    pub source: String,

    /// Destination server to replay the stream to
    #[arg(short = 'd', value_name = "host:port")]
    pub destination: String,

    /// Buckets to migrate: a list (1,2;3) or an inclusive range ([4,9]); repeatable
    #[arg(short = 'b', value_name = "spec", required = true)]
    pub buckets: Vec<String>,

    /// Authenticate as this user (password prompted, or one line on stdin)
    #[arg(short = 'a', value_name = "user")]
    pub user: Option<String>,

    /// Takeover mode: ask the source to hand each bucket over
    #[arg(short = 't')]
    pub takeover: bool,

    /// Request TAP acks from the source
    #[arg(short = 'A')]
    pub tap_ack: bool,

    /// Register as a named TAP client on the source
    #[arg(short = 'r')]
    pub register: bool,

    /// Name of the TAP stream
    #[arg(short = 'N', value_name = "name")]
    pub name: Option<String>,

    /// Flush the destination's queue before streaming
    #[arg(short = 'F')]
    pub flush: bool,

    /// Override the expiry on replayed mutations
    #[arg(short = 'E', value_name = "seconds")]
    pub expiry: Option<u32>,

    /// Override the flags on replayed mutations
    #[arg(short = 'f', value_name = "flag")]
    pub flags: Option<u32>,

    /// Per-socket and liveness timeout in seconds (0 disables)
    #[arg(short = 'T', value_name = "seconds", default_value_t = 0)]
    pub timeout: u32,

    /// Validate bucket states on the destination after a takeover
    #[arg(short = 'V')]
    pub validate: bool,

    /// Erlang port mode: exit when stdin closes
    #[arg(short = 'e')]
    pub erlang_port: bool,

    /// Increase verbosity; repeatable
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Backoff side channel parameters: delay,threshold ('-' keeps a default)
    #[arg(short = 'M', value_name = "delay,threshold")]
    pub backoff: Option<String>,

    /// Print help
    #[arg(long, action = ArgAction::HelpLong)]
    help: Option<bool>,

    /// Print version
    #[arg(long, action = ArgAction::Version)]
    version: Option<bool>,
}
