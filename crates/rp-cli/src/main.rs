#![deny(unsafe_code)]
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rp_config::{ConfigOverrides, ResourceConfig};
use rp_runtime::ResourceModule;
use rp_source::ChangeValue;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "rp", version, about = "Resource pipeline tool")]
struct Args {
    /// JSON configuration file (settings under the `resource` key).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Append a local compiled-cache root.
    #[arg(long = "resource-local-path", global = true)]
    resource_local_path: Vec<PathBuf>,

    /// Root of the source change-log tree.
    #[arg(long = "resource-source-path", global = true)]
    resource_source_path: Option<PathBuf>,

    /// Base path imports are resolved against.
    #[arg(long = "resource-base-path", global = true)]
    resource_base_path: Option<PathBuf>,

    /// Add a directory to the autoimport watch set.
    #[arg(long = "resource-autoimport-path", global = true)]
    resource_autoimport_path: Vec<PathBuf>,

    /// Add an external tool search directory.
    #[arg(long = "resource-tool-path", global = true)]
    resource_tool_path: Vec<PathBuf>,

    /// Sourced endpoint forwarded to external tools.
    #[arg(long = "resource-remote-sourced", global = true)]
    resource_remote_sourced: Option<String>,

    /// Compiled endpoint (unused by local commands, kept for parity).
    #[arg(long = "resource-remote-compiled", global = true)]
    resource_remote_compiled: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a path to its UUID and signature hash.
    Lookup {
        /// File to resolve.
        path: PathBuf,
    },
    /// Import (or re-import) a file.
    Import {
        /// File to import.
        path: PathBuf,
    },
    /// Compile a resource for a platform.
    Compile {
        /// Resource UUID.
        uuid: Uuid,
        /// Packed platform value; 0 means any.
        #[arg(long, default_value_t = 0)]
        platform: u64,
    },
    /// Print a source change log.
    Dump {
        /// Resource UUID.
        uuid: Uuid,
    },
    /// Remove a resource: source, blobs, artifacts, map entry.
    Delete {
        /// Resource UUID.
        uuid: Uuid,
    },
}

impl Args {
    fn config(&self) -> Result<ResourceConfig> {
        let mut config = match &self.config {
            Some(path) => ResourceConfig::load(path)
                .with_context(|| format!("load config {}", path.display()))?,
            None => ResourceConfig::default(),
        };
        config.apply_overrides(&ConfigOverrides {
            local_paths: self.resource_local_path.clone(),
            source_path: self.resource_source_path.clone(),
            base_path: self.resource_base_path.clone(),
            autoimport_paths: self.resource_autoimport_path.clone(),
            tool_paths: self.resource_tool_path.clone(),
            remote_sourced: self.resource_remote_sourced.clone(),
            remote_compiled: self.resource_remote_compiled.clone(),
        });
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let module = ResourceModule::initialize(args.config()?, |_| {});
    let engine = module.engine().clone();

    let outcome = match args.command {
        Command::Lookup { path } => {
            match engine.lookup(&path)? {
                Some((uuid, signature)) => {
                    println!("{uuid} {signature}");
                    Ok(())
                }
                None => bail!("no resource for {}", path.display()),
            }
        }
        Command::Import { path } => {
            let (uuid, hash) = engine
                .import(&path)
                .with_context(|| format!("import {}", path.display()))?;
            println!("{uuid} {hash}");
            Ok(())
        }
        Command::Compile { uuid, platform } => {
            engine
                .compile(uuid, platform)
                .with_context(|| format!("compile {uuid}"))?;
            Ok(())
        }
        Command::Dump { uuid } => {
            let source = engine.read_source(uuid)?;
            println!("state: {:?}, hash: {}", source.state(), source.source_hash());
            for change in source.iter() {
                let payload = match change.value {
                    ChangeValue::Value(bytes) => match std::str::from_utf8(bytes) {
                        Ok(text) => format!("= {text:?}"),
                        Err(_) => format!("= <{} bytes>", bytes.len()),
                    },
                    ChangeValue::Blob { checksum, size } => {
                        format!("# {checksum:016x} ({size} bytes)")
                    }
                    ChangeValue::Unset => "-".to_string(),
                };
                println!(
                    "{:>8} {:016x} {:016x} {payload}",
                    change.timestamp, change.key, change.platform
                );
            }
            Ok(())
        }
        Command::Delete { uuid } => {
            engine.delete(uuid).with_context(|| format!("delete {uuid}"))?;
            Ok(())
        }
    };

    module.finalize().await;
    outcome
}
