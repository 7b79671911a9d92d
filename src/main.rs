//! Thin binary entry point: parse the CLI, resolve configuration,
//! initialize diagnostic logging, then hand off to the [`control::Daemon`].
//!
//! Kept deliberately small so the control loop, probes and selectors stay
//! testable as a library without root or a live `/proc` tree (see
//! `src/lib.rs` and each module's `#[cfg(test)]` suite).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use thrash_protect::config::{CliArgs, Config};
use thrash_protect::control::Daemon;

fn init_tracing(config: &Config) {
    use tracing_subscriber::EnvFilter;

    let default_level = if config.diagnostic_logging {
        "trace"
    } else if config.debug_logging {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    #[cfg(not(target_os = "linux"))]
    {
        eprintln!("thrash-protect requires /proc and cgroup v2 and only runs on Linux.");
        std::process::exit(1);
    }

    let cli = CliArgs::parse();
    let config = Config::resolve(&cli);
    init_tracing(&config);

    tracing::info!(
        interval = config.interval,
        swap_page_threshold = config.swap_page_threshold,
        storage_type = ?config.storage_type,
        "thrash-protect starting"
    );

    let mut daemon = Daemon::new(config);
    daemon.startup();

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        if let Err(e) = ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        }) {
            tracing::warn!(error = %e, "failed to install SIGINT/SIGTERM handler, continuing without one");
        }
    }

    let run_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        daemon.run(|| !running.load(Ordering::SeqCst))
    }));

    // Cleanup must run regardless of how the loop ended: a clean stop, a
    // fatal probe failure, or an uncaught panic.
    daemon.cleanup();

    match run_result {
        Ok(true) => {
            tracing::info!("thrash-protect exiting cleanly");
            std::process::exit(0);
        }
        Ok(false) => {
            tracing::error!("thrash-protect exiting after a fatal probe failure");
            std::process::exit(1);
        }
        Err(_) => {
            tracing::error!("thrash-protect exiting after an unexpected panic in the control loop");
            std::process::exit(1);
        }
    }
}
