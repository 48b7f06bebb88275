//! Library entry for the `hostwatch` engine.
//!
//! Exposes `inner_main` so the workspace-level shim binary can call into it, and
//! the engine itself for embedding:
//! - [`app::HostRegistry`] tracks hosts, races their addresses and polls them
//! - the collaborator traits in [`probe`], [`db`], [`cache`], [`stun`] and
//!   [`notifier`] along with their default implementations
//! - [`discovery`] feeds mDNS announcements into the registry
#![cfg_attr(
    test,
    expect(
        clippy::unwrap_used,
        clippy::indexing_slicing,
        reason = "This is not problematic in tests"
    )
)]

extern crate alloc;
extern crate core;

pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod db;
pub mod discovery;
pub mod notifier;
pub mod probe;
pub mod run;
pub mod stun;

use std::{io, path::PathBuf, process, sync::Once};

use eyre::Result;
use tracing::{Instrument as _, info, info_span};
use tracing_subscriber::{EnvFilter, fmt::time::ChronoLocal};

use cli::{Cli, Command, LogFormat};

pub use app::{Collaborators, HostRegistry, NetworkChange, RegistryError};

static INIT_TRACING: Once = Once::new();

/// Logs go to stderr so stdout stays machine readable.
fn init_tracing(format: LogFormat) {
    INIT_TRACING.call_once(move || {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_timer(ChronoLocal::rfc_3339())
            .with_writer(io::stderr);

        match format {
            LogFormat::Compact => builder.compact().init(),
            LogFormat::Json => builder.json().init(),
            LogFormat::Pretty => builder.pretty().init(),
        }
    });
}

/// hostwatch's main function; can be called from a shim binary.
///
/// # Errors
///
/// Returns an error if the engine cannot be started, or if `probe` finds no
/// reachable address.
pub async fn inner_main(invocation: Cli) -> Result<()> {
    match invocation.command {
        Command::Watch(args) => {
            init_tracing(args.log_format);
            let config_path = PathBuf::from(&args.config);
            let startup_span = info_span!(
                "hostwatch",
                ?config_path,
                pid = process::id(),
                version = env!("CARGO_PKG_VERSION")
            );
            async {
                info!("Starting hostwatch");
                run::watch(&config_path).await
            }
            .instrument(startup_span)
            .await
        }
        Command::Probe(args) => {
            init_tracing(args.log_format);
            run::probe_once(args).await
        }
    }
}
