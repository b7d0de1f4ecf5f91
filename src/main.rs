//! mxlink - keeps a Matrix session alive from the command line.
//!
//! The binary logs into a Matrix account described by a YAML configuration
//! file, runs the standing sync loop and persists the session to a data
//! directory so the next run resumes without a new login.
//!
//! # Usage
//!
//! ```bash
//! mxlink --config config.yaml --data ./mxlink-data
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (default: `info`)
//! - `MXLINK_*` - Configuration overrides, see [`mxlink::config`]

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use mxlink::{
    config::Config,
    matrix::{Action, Error, ErrorClass, MatrixApi, store::SessionStore},
    utils::get_path,
};

/// Command-line arguments.
///
/// # Examples
///
/// ```bash
/// mxlink --config config.yaml --data ./mxlink-data
/// ```
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file.
    ///
    /// See the [`mxlink::config`] module for the expected format.
    #[arg(short, long)]
    config: String,

    /// Path to the directory for storing persistent data.
    ///
    /// This directory will contain:
    /// - `session/session` - homeserver, access token and sync cursor
    /// - `files/` - downloaded media
    ///
    /// The access token allows impersonation of the account: keep the
    /// directory private.
    #[arg(short, long)]
    data: String,
}

/// What the sync task reported, forwarded to the main loop.
struct Report {
    action: Action,
    error: Option<ErrorClass>,
}

#[tokio::main]
async fn main() {
    // Put logger at info level by default
    let env = Env::default().filter_or("RUST_LOG", "info");
    env_logger::init_from_env(env);

    info!("Starting mxlink {}...", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load config file: {}", e);
            return;
        }
    };

    if let Err(e) = run(config, &args.data).await {
        error!("{:#}", e);
    }
}

async fn run(mut config: Config, data_dir: &str) -> anyhow::Result<()> {
    let store = SessionStore::new(&get_path(data_dir, "session"))
        .await
        .context("cannot open session store")?;
    if store.has_session() {
        info!("resuming stored session");
    }
    let session = store.restore(config.session().context("invalid matrix configuration")?);

    let (sender, mut receiver) = mpsc::unbounded_channel();
    let handler = move |action: Action, _: Option<&Value>, error: Option<&Error>| {
        debug!("{:?} done", action);
        let _ = sender.send(Report {
            action,
            error: error.map(Error::class),
        });
    };

    let api = MatrixApi::new(session, None, handler, config.api_config(Path::new(data_dir)))
        .await
        .context("cannot create matrix client")?;
    api.start_sync().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut outcome = Ok(());
    loop {
        let report = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down...");
                break;
            }
            report = receiver.recv() => report,
        };
        let Some(report) = report else {
            break;
        };

        match (report.action, report.error) {
            (Action::Login | Action::UploadFilter, None) => {
                if let Err(e) = store.persist_api_session(&api).await {
                    warn!("cannot persist session: {}", e);
                }
            }
            (Action::Sync, None) => {
                let cursor = api
                    .with_session(|s| s.sync_cursor().map(ToOwned::to_owned))
                    .await;
                if let Some(cursor) = cursor
                    && let Err(e) = store.persist_sync_token(&cursor).await
                {
                    warn!("cannot persist sync token: {}", e);
                }
            }
            (Action::Relogin, _) => info!("access token expired, logging in again"),
            (Action::SyncPaused, _) => info!("network trouble, sync paused"),
            (_, Some(ErrorClass::RateLimited)) => {}
            (action, Some(_)) if action.is_sync_step() => {
                outcome = Err(anyhow::anyhow!("{:?} failed, giving up", action));
                break;
            }
            (action, Some(class)) => warn!("{:?} failed ({:?})", action, class),
            _ => {}
        }
    }

    api.stop_sync().await;
    outcome
}
