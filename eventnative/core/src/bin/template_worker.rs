//! Template worker process.
//!
//! Spawned by the host with the transport selected through environment
//! variables. Stdout belongs to the transport, so logs go to stderr where the
//! host picks them up.

use eventnative_core::{runtime, transport};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let result = transport::worker_channel_from_env()
        .and_then(|mut channel| runtime::serve(channel.as_mut()));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "template worker failed");
            ExitCode::FAILURE
        }
    }
}
