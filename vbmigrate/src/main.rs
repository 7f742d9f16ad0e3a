use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vbmigrate::cli::Cli;
use vbmigrate::engine::{Engine, EngineConfig};
use vbmigrate::watchdog;
use vbmigrate_core::backoff::{self, BackoffLimits, Slowdown};
use vbmigrate_core::buckets::parse_buckets;
use vbmigrate_core::credentials::read_password;
use vbmigrate_core::endpoint::HostPort;
use vbmigrate_core::error::exit_code;
use vbmigrate_core::{MigrateError, Result};
use vbmigrate_tap::frame::opcode;
use vbmigrate_tap::tap::MutationRewrite;
use vbmigrate_tap::{probe, sasl, sync_io, Message, TapConnect, VBucketFilter, VBucketState};

/// How often and how long `-V` polls a bucket for the active state.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);
const PROBE_ATTEMPTS: u32 = 100;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let kind = err.kind();
            let _ = err.print();
            return match kind {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    exit_code::OK
                }
                _ => exit_code::USAGE,
            };
        }
    };

    init_tracing(cli.verbose);

    let (mut engine, buckets) = match setup(&cli) {
        Ok(parts) => parts,
        Err(err) => {
            error!("{err}");
            return err.setup_exit_code();
        }
    };

    let report = match engine.run() {
        Ok(report) => report,
        Err(err) => {
            error!("{err}");
            return err.exit_code();
        }
    };
    info!(
        moved = report.moved,
        packets = report.packets,
        "stream finished"
    );

    if cli.takeover && cli.validate {
        let timeout = io_timeout(&cli).or(Some(Duration::from_secs(5)));
        if let Err(err) = validate(engine, &buckets, timeout) {
            error!("{err}");
            return err.exit_code();
        }
    }

    exit_code::OK
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn io_timeout(cli: &Cli) -> Option<Duration> {
    (cli.timeout > 0).then(|| Duration::from_secs(u64::from(cli.timeout)))
}

/// Resolve the configuration, bring up the side channels, connect and
/// authenticate both endpoints, and hand the sockets to a ready reactor.
fn setup(cli: &Cli) -> Result<(Engine, Vec<u16>)> {
    let mut ids = Vec::new();
    for spec in &cli.buckets {
        parse_buckets(&mut ids, spec)?;
    }
    let filter = VBucketFilter::new(ids);
    if filter.is_empty() {
        return Err(MigrateError::usage(
            "Please specify the buckets to migrate by using -b",
        ));
    }
    let buckets = filter.ids().to_vec();

    let source = HostPort::parse(&cli.source)?;
    let destination = HostPort::parse(&cli.destination)?;
    let timeout = io_timeout(cli);

    let backoff = match &cli.backoff {
        Some(spec) => {
            let limits = BackoffLimits::parse(spec)?;
            info!(
                delay_us = limits.delay_us,
                threshold = limits.threshold,
                "using backoff limits"
            );
            let slowdown = Slowdown::new();
            backoff::start_monitor(&destination, limits, slowdown.clone())?;
            Some((slowdown, limits))
        }
        None => None,
    };

    let credentials = match &cli.user {
        Some(user) => Some((user.clone(), read_password(user)?)),
        None => None,
    };

    info!(%destination, "connecting to destination");
    let mut dest_stream = TcpStream::connect(destination.resolve()?)?;
    sync_io::prepare_sync(&dest_stream, timeout)?;
    if let Some((user, password)) = &credentials {
        sasl::authenticate(&mut dest_stream, user, password)?;
    }

    // The flush must land before the source is contacted.
    if cli.flush {
        info!("flushing the destination queue before streaming");
        sync_io::write_message(
            &mut dest_stream,
            &Message::request(opcode::FLUSHQ, 0, 0, b"", b"", b""),
        )?;
    }

    info!(%source, "connecting to source");
    let mut src_stream = TcpStream::connect(source.resolve()?)?;
    sync_io::prepare_sync(&src_stream, timeout)?;
    if let Some((user, password)) = &credentials {
        sasl::authenticate(&mut src_stream, user, password)?;
    }

    sync_io::prepare_async(&src_stream)?;
    sync_io::prepare_async(&dest_stream)?;

    let mut engine = Engine::new(
        mio::net::TcpStream::from_std(src_stream),
        mio::net::TcpStream::from_std(dest_stream),
        EngineConfig {
            filter,
            rewrite: MutationRewrite {
                expiry: cli.expiry,
                flags: cli.flags,
            },
            takeover: cli.takeover,
            timeout_secs: cli.timeout,
            backoff,
        },
    )?;

    engine.send_upstream(
        TapConnect {
            buckets: buckets.clone(),
            takeover: cli.takeover,
            support_ack: cli.tap_ack,
            registered: cli.register,
            name: cli.name.clone(),
        }
        .build(),
    )?;

    if cli.erlang_port {
        let (waker, flag) = engine.port_waker()?;
        watchdog::spawn(waker, flag)?;
    }

    Ok((engine, buckets))
}

/// Post-takeover validation: poll the destination until every migrated
/// bucket reports active.
fn validate(engine: Engine, buckets: &[u16], timeout: Option<Duration>) -> Result<()> {
    let mut stream = sync_io::into_std(engine.into_destination());
    sync_io::prepare_sync(&stream, timeout)?;

    for &vbucket in buckets {
        let mut attempts = 0;
        loop {
            match probe::get_vbucket_state(&mut stream, vbucket)? {
                VBucketState::Active => {
                    info!(vbucket, "validated active on destination");
                    break;
                }
                state => {
                    attempts += 1;
                    if attempts >= PROBE_ATTEMPTS {
                        return Err(MigrateError::software(format!(
                            "bucket {vbucket} is {state:?} on the destination after takeover"
                        )));
                    }
                    thread::sleep(PROBE_INTERVAL);
                }
            }
        }
    }
    Ok(())
}
