//! golden-watcher - golden image review service
//!
//! Watches a connected device (default), the test runner's output tree
//! (`--atest`) or the IDE run output tree (`--studio-test`) for updated
//! goldens and serves them to the review UI on localhost.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use golden_common::config::{
    resolve_build_top, resolve_client_url, resolve_port, TomlConfig, BUILD_TOP_ENV, PORT_ENV,
};
use golden_common::token::TokenStore;
use golden_watcher::source::{
    runner_log::default_runner_root, studio::STUDIO_ROOT, AdbClient, ArtifactSource,
    DeviceSource, RunnerLogSource, StudioSource,
};
use golden_watcher::{build_router, AppState, GoldenCache};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for golden-watcher
#[derive(Parser, Debug)]
#[command(name = "golden-watcher")]
#[command(about = "Watches a connected device or local test output for golden file updates")]
#[command(version)]
struct Args {
    /// Port to run the watcher API on (0 picks a free port)
    #[arg(long)]
    port: Option<u16>,

    /// Watch the test runner's output tree
    #[arg(long, conflicts_with = "studio_test")]
    atest: bool,

    /// Watch artifacts of deviceless tests run from the IDE
    #[arg(long, alias = "studioTest")]
    studio_test: bool,

    /// Device serial to pull goldens from
    #[arg(long, env = "ANDROID_SERIAL")]
    serial: Option<String>,

    /// Root directory of the source checkout
    #[arg(long)]
    android_build_top: Option<PathBuf>,

    /// URL where the review UI is deployed
    #[arg(long)]
    client_url: Option<String>,

    /// Output tree to watch instead of the default for --atest / --studio-test
    #[arg(long)]
    artifact_root: Option<PathBuf>,

    /// Print the UI address without opening a browser
    #[arg(long)]
    no_browser: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "golden_watcher=info,golden_common=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting golden-watcher v{}", env!("CARGO_PKG_VERSION"));

    let toml = TomlConfig::load_default();
    let build_top = resolve_build_top(args.android_build_top.as_deref(), BUILD_TOP_ENV, &toml)
        .context("Cannot locate the source checkout")?;
    let port = resolve_port(args.port, PORT_ENV, &toml)?;
    let client_url = resolve_client_url(args.client_url.as_deref(), &toml);
    info!("Source checkout: {}", build_top.display());

    let access_token = TokenStore::at_default_location().get_or_create();

    // Removed when dropped at the end of main
    let workspace = tempfile::Builder::new()
        .prefix("motion-golden-")
        .tempdir()
        .context("Failed to create workspace directory")?;
    info!("Workspace: {}", workspace.path().display());

    let source = tokio::task::spawn_blocking({
        let args = SourceArgs::from(&args);
        move || select_source(args)
    })
    .await??;
    info!("Watching {} artifacts", source.name());

    let cache = tokio::task::spawn_blocking({
        let mut cache = GoldenCache::new(source, workspace.path(), build_top);
        move || cache.refresh().map(|_| cache)
    })
    .await?
    .context("Initial golden refresh failed")?;

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .context("Failed to bind to address")?;
    let port = listener.local_addr()?.port();
    let public_url = format!("http://localhost:{}", port);

    let state = AppState::new(cache, access_token.clone(), public_url.clone());
    let app = build_router(state);

    info!("golden-watcher listening on {}", public_url);
    let ui_address = format!("{}?token={}&port={}", client_url, access_token, port);
    println!("Open UI at {}", ui_address);
    if !args.no_browser {
        open_browser(&ui_address);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down");
    drop(workspace);
    Ok(())
}

/// Arguments that decide which artifact source to build
#[derive(Debug, Clone)]
struct SourceArgs {
    atest: bool,
    studio_test: bool,
    serial: Option<String>,
    artifact_root: Option<PathBuf>,
}

impl From<&Args> for SourceArgs {
    fn from(args: &Args) -> Self {
        Self {
            atest: args.atest,
            studio_test: args.studio_test,
            serial: args.serial.clone(),
            artifact_root: args.artifact_root.clone(),
        }
    }
}

/// Build the one artifact source used for the whole run
fn select_source(args: SourceArgs) -> Result<Box<dyn ArtifactSource>> {
    if args.atest {
        let root = args.artifact_root.unwrap_or_else(default_runner_root);
        info!("Watching test runner output at {}", root.display());
        return Ok(Box::new(
            RunnerLogSource::new(root).context("Test runner output not found")?,
        ));
    }

    if args.studio_test {
        let root = args.artifact_root.unwrap_or_else(|| PathBuf::from(STUDIO_ROOT));
        info!("Watching deviceless IDE test output at {}", root.display());
        return Ok(Box::new(
            StudioSource::new(root).context("IDE test output not found")?,
        ));
    }

    let adb = match args.serial {
        Some(serial) => AdbClient::new(serial),
        None => AdbClient::for_single_device().context("Cannot select a device")?,
    };
    info!("Pulling goldens from device {}", adb.serial());
    Ok(Box::new(
        DeviceSource::connect(adb).context("Cannot get root access on the device")?,
    ))
}

/// Best-effort launch of the platform URL opener
fn open_browser(url: &str) {
    let mut command = if cfg!(target_os = "macos") {
        std::process::Command::new("open")
    } else if cfg!(target_os = "windows") {
        let mut command = std::process::Command::new("cmd");
        command.args(["/C", "start", ""]);
        command
    } else {
        std::process::Command::new("xdg-open")
    };

    if let Err(e) = command.arg(url).spawn() {
        warn!("Could not open a browser ({}); open the UI address manually", e);
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
