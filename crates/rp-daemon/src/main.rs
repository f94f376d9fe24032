#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use rp_config::{ConfigOverrides, ResourceConfig};
use rp_daemon::{
    autoimport_pump, bind_dual, event_pump, serve_compiled, serve_sourced,
    DEFAULT_COMPILED_PORT, DEFAULT_SOURCED_PORT,
};
use rp_engine::PollingMonitor;
use rp_runtime::ResourceModule;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rp-daemon", version, about = "Resource pipeline daemon")]
struct Args {
    /// JSON configuration file (settings under the `resource` key).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port of the sourced service.
    #[arg(long, default_value_t = DEFAULT_SOURCED_PORT)]
    sourced_port: u16,

    /// Port of the compiled service.
    #[arg(long, default_value_t = DEFAULT_COMPILED_PORT)]
    compiled_port: u16,

    /// Seconds between autoimport filesystem scans.
    #[arg(long, default_value_t = 1)]
    autoimport_interval: u64,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Append a local compiled-cache root.
    #[arg(long = "resource-local-path")]
    resource_local_path: Vec<PathBuf>,

    /// Root of the source change-log tree.
    #[arg(long = "resource-source-path")]
    resource_source_path: Option<PathBuf>,

    /// Base path imports are resolved against.
    #[arg(long = "resource-base-path")]
    resource_base_path: Option<PathBuf>,

    /// Add a directory to the autoimport watch set.
    #[arg(long = "resource-autoimport-path")]
    resource_autoimport_path: Vec<PathBuf>,

    /// Add an external tool search directory.
    #[arg(long = "resource-tool-path")]
    resource_tool_path: Vec<PathBuf>,

    /// Upstream sourced endpoint (host:port).
    #[arg(long = "resource-remote-sourced")]
    resource_remote_sourced: Option<String>,

    /// Upstream compiled endpoint (host:port).
    #[arg(long = "resource-remote-compiled")]
    resource_remote_compiled: Option<String>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            local_paths: self.resource_local_path.clone(),
            source_path: self.resource_source_path.clone(),
            base_path: self.resource_base_path.clone(),
            autoimport_paths: self.resource_autoimport_path.clone(),
            tool_paths: self.resource_tool_path.clone(),
            remote_sourced: self.resource_remote_sourced.clone(),
            remote_compiled: self.resource_remote_compiled.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("rp_daemon=debug,rp_engine=debug,rp_runtime=debug,rp_remote=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => ResourceConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => ResourceConfig::default(),
    };
    config.apply_overrides(&args.overrides());

    // The daemon compiles through external `*compile` tools; in-process
    // plug-ins belong to embedding applications.
    let module = Arc::new(ResourceModule::initialize(config, |_| {}));

    let sourced_listeners = bind_dual(args.sourced_port)
        .await
        .context("bind sourced service")?;
    let compiled_listeners = bind_dual(args.compiled_port)
        .await
        .context("bind compiled service")?;

    for listener in sourced_listeners {
        info!(addr = %listener.local_addr()?, "sourced service listening");
        tokio::spawn(serve_sourced(module.clone(), listener));
    }
    for listener in compiled_listeners {
        info!(addr = %listener.local_addr()?, "compiled service listening");
        tokio::spawn(serve_compiled(module.clone(), listener));
    }

    tokio::spawn(event_pump(module.clone()));
    let monitor = PollingMonitor::new(module.engine().watched_dirs());
    tokio::spawn(autoimport_pump(
        module.clone(),
        Box::new(monitor),
        Duration::from_secs(args.autoimport_interval.max(1)),
    ));

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    module.finalize().await;
    Ok(())
}
