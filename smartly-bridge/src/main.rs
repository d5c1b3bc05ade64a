#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

// Used by the smartly-bridge library.
use {
    async_trait as _, axum as _, base64 as _, bytes as _, camino as _, cfg_if as _, futures as _, hex as _, hmac as _,
    http_body_util as _, hyper as _, hyper_util as _, ipnetwork as _, parking_lot as _, rand as _, reqwest as _,
    secrecy as _, serde as _, sha2 as _, thiserror as _, time as _, tracing_appender as _, tracing_subscriber as _,
    url as _, uuid as _,
};
// Used by tests.
#[cfg(test)]
use {proptest as _, rstest as _, tower as _};

#[macro_use]
extern crate tracing;

mod service;

use std::sync::Arc;

use anyhow::Context;
use smartly_bridge::config::ConfHandle;
use smartly_bridge::hub::{self, DynHub};
use tap::prelude::*;

use crate::service::BridgeService;

enum CliAction {
    ShowHelp,
    Run,
    ConfigInitOnly,
}

fn main() -> anyhow::Result<()> {
    run().inspect_err(|error| {
        let bootstacktrace_path = smartly_bridge::config::get_data_dir().join("boot.stacktrace");

        if let Err(write_error) = std::fs::write(&bootstacktrace_path, format!("{error:?}")) {
            eprintln!("Failed to write the boot stacktrace to {bootstacktrace_path}: {write_error}");
        }
    })
}

fn run() -> anyhow::Result<()> {
    let mut args = std::env::args();
    let executable = args.next().context("executable name is missing from the environment")?;

    // Extract and remove --config-path argument if provided
    let mut config_path = None;
    let mut remaining_args = Vec::new();

    while let Some(arg) = args.next() {
        if arg == "--config-path" {
            if let Some(path) = args.next() {
                config_path = Some(path);
            } else {
                anyhow::bail!("missing value for --config-path");
            }
        } else {
            remaining_args.push(arg);
        }
    }

    if let Some(path) = config_path {
        // SAFETY: At this point the program is single-threaded.
        unsafe { std::env::set_var("SMARTLY_BRIDGE_CONFIG_PATH", &path) };
    }

    let action = match remaining_args.first().map(String::as_str) {
        Some("--config-init-only") => CliAction::ConfigInitOnly,
        None => CliAction::Run,
        Some(_) => CliAction::ShowHelp,
    };

    match action {
        CliAction::ShowHelp => {
            println!(
                r#"HELP:

    Run:
        "{executable}"

    Initialize configuration only (will not override existing configuration):
        "{executable}" --config-init-only

    Options:
        --config-path <CONFIG_PATH>
"#
            )
        }
        CliAction::ConfigInitOnly => {
            let conf_file = smartly_bridge::config::load_conf_file_or_generate_new()?;
            let conf_file_json =
                serde_json::to_string_pretty(&conf_file).context("couldn't represent config file as JSON")?;
            println!("{conf_file_json}");
        }
        CliAction::Run => {
            let conf_handle = ConfHandle::init().context("unable to initialize configuration")?;

            // The hub adapter is provided by the embedding runtime; the
            // standalone binary runs detached for bring-up and diagnostics.
            let hub: DynHub = Arc::new(hub::DetachedHub::new());

            let mut service = BridgeService::load(conf_handle, hub).context("service loading failed")?;

            service
                .start()
                .tap_err(|error| error!(error = format!("{error:#}"), "Failed to start"))?;

            // Park the main thread until the OS asks us to stop.
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
                .context("failed to build the async runtime")?;
            rt.block_on(wait_for_stop_signal())?;

            service.stop();
        }
    }

    Ok(())
}

/// Resolves once the OS delivers a stop request.
#[cfg(unix)]
async fn wait_for_stop_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).context("cannot install the SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("cannot install the SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => debug!("Received SIGTERM"),
        _ = sigint.recv() => debug!("Received SIGINT"),
    }

    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("cannot install the CTRL-C handler")?;
    debug!("Received CTRL-C");
    Ok(())
}
