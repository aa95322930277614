//! # Proxy Router
//!
//! Per-host upstream proxy selection with hot-reloaded settings.
//!
//! ## Usage
//!
//! ```bash
//! # Decide how URLs would be routed
//! proxy-router decide https://www.example.com/ http://localhost:8080/
//!
//! # Answer one URL per stdin line, reloading when the settings file changes
//! proxy-router serve
//!
//! # Edit settings
//! proxy-router profile add --name Tor --type socks --host 127.0.0.1 --port 9050
//! proxy-router map add example.com --profile <id>
//! proxy-router switch global on
//!
//! # Increase verbosity
//! proxy-router -vvv serve  # trace level
//! ```
//!
//! ## Configuration
//!
//! See `proxy-router.example.yaml` for all available options.

use clap::{Parser, Subcommand, ValueEnum};
use proxy_router::config::AppConfig;
use proxy_router::engine::{DecisionEngine, RequestDescriptor, Verdict};
use proxy_router::error::Result;
use proxy_router::profile::ProxyType;
use proxy_router::snapshot::SnapshotBuilder;
use proxy_router::store::{FileStore, SettingsStore, StorageArea};
use proxy_router::{coverage, logging, ProfileDraft, SettingsEditor};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};

/// Per-host upstream proxy selection with hot-reloaded settings.
#[derive(Parser, Debug)]
#[command(name = "proxy-router")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "PROXY_ROUTER_CONFIG")]
    config: Option<PathBuf>,

    /// Settings file (overrides config)
    #[arg(short, long, env = "PROXY_ROUTER_STORE")]
    store: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace, -vvvv trace+deps)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Converts verbosity count to log level string
    fn log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }
        match self.verbose {
            0 => None, // Use config default
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()), // 4+ includes dependency tracing
        }
    }

    /// Whether to include verbose dependency logging
    fn trace_deps(&self) -> bool {
        self.verbose >= 4
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the routing decision for each URL
    Decide {
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Read URLs from stdin and answer each with a decision, hot-reloading settings
    Serve,

    /// Print the normalized settings currently in effect
    Show,

    /// Export settings as JSON
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replace settings with an exported JSON file
    Import { file: PathBuf },

    /// Copy settings between the local and sync areas
    Sync {
        #[arg(value_enum)]
        direction: SyncDirection,
    },

    /// Manage proxy profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },

    /// Manage host mappings
    Map {
        #[command(subcommand)]
        command: MapCommand,
    },

    /// Replace the whitelist
    Whitelist { entries: Vec<String> },

    /// Set the default profile; clears it when no id is given
    Default { id: Option<String> },

    /// Turn the master or global switch on or off
    Switch {
        #[arg(value_enum)]
        switch: SwitchName,
        #[arg(value_enum)]
        state: SwitchState,
    },

    /// Report how many of the given URLs are covered by a host mapping
    Coverage {
        #[arg(required = true)]
        urls: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ProfileCommand {
    /// Add a profile, or edit one when --id is given
    Add {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: String,
        #[arg(long = "type", default_value = "http", value_parser = parse_proxy_type)]
        kind: ProxyType,
        #[arg(long)]
        host: String,
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
    },
    /// Remove a profile and its host mappings
    Remove { id: String },
}

#[derive(Subcommand, Debug)]
enum MapCommand {
    /// Map a host (and its subdomains) to a profile; no profile means the default.
    /// A full URL maps its host.
    Add {
        host: String,
        #[arg(long)]
        profile: Option<String>,
    },
    /// Remove a host mapping
    Remove { host: String },
    /// Change the profile of an existing mapping
    Set {
        host: String,
        #[arg(long)]
        profile: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SyncDirection {
    /// local -> sync
    Push,
    /// sync -> local
    Pull,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SwitchName {
    Master,
    Global,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SwitchState {
    On,
    Off,
}

fn parse_proxy_type(name: &str) -> std::result::Result<ProxyType, String> {
    Ok(ProxyType::from_name(name))
}

/// One answered request.
#[derive(Serialize)]
struct DecisionLine<'a> {
    url: &'a str,
    #[serde(flatten)]
    verdict: &'a Verdict,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Application entry point.
#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = load_config(&args);
    if let Some(ref store) = args.store {
        config.store.path = store.clone();
    }

    let _log_guard = match logging::init_logging(&config.logging, args.log_level(), args.trace_deps()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    debug!(
        version = env!("CARGO_PKG_VERSION"),
        store = %config.store.path.display(),
        area = %config.store.area,
        "Starting proxy-router"
    );

    if let Err(e) = run(args.command, &config).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Load configuration from file or use defaults
fn load_config(args: &Args) -> AppConfig {
    match AppConfig::discover(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: {}", e);
            eprintln!("Using default configuration");
            AppConfig::default()
        }
    }
}

async fn run(command: Command, config: &AppConfig) -> Result<()> {
    let file_store = FileStore::open(&config.store.path)?;
    let store: Arc<dyn SettingsStore> = Arc::new(file_store.clone());
    let area = config.store.area;
    let editor = SettingsEditor::new(store.clone(), area);

    match command {
        Command::Decide { urls } => {
            let engine = Arc::new(DecisionEngine::default());
            SnapshotBuilder::new(store, engine.clone(), area).rebuild().await?;
            for url in &urls {
                let verdict = engine.evaluate(&RequestDescriptor::new(url.as_str()));
                print_json(&DecisionLine { url, verdict: &verdict })?;
            }
        }
        Command::Serve => {
            let engine = Arc::new(DecisionEngine::default());
            file_store.start_watcher(config.store.debounce())?;
            let builder = SnapshotBuilder::new(store, engine.clone(), area)
                .spawn()
                .await;
            info!(store = %file_store.path().display(), area = %area, "Serving decisions from stdin");
            serve(&engine).await?;
            builder.abort();
        }
        Command::Show => {
            let engine = Arc::new(DecisionEngine::default());
            SnapshotBuilder::new(store, engine.clone(), area).rebuild().await?;
            let record = engine.load().to_record();
            println!("{}", serde_json::to_string_pretty(&Value::Object(record))?);
        }
        Command::Export { output } => {
            let json = editor.export_json().await?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, json).await?;
                    info!(path = %path.display(), "Settings exported");
                }
                None => println!("{}", json),
            }
        }
        Command::Import { file } => {
            let json = tokio::fs::read_to_string(&file).await?;
            let settings = editor.import_json(&json).await?;
            println!(
                "Imported {} profiles and {} host mappings",
                settings.profiles.len(),
                settings.mappings.len()
            );
        }
        Command::Sync { direction } => {
            let (from, to) = match direction {
                SyncDirection::Push => (StorageArea::Local, StorageArea::Sync),
                SyncDirection::Pull => (StorageArea::Sync, StorageArea::Local),
            };
            SettingsEditor::new(store, from).copy_to(to).await?;
        }
        Command::Profile { command } => match command {
            ProfileCommand::Add {
                id,
                name,
                kind,
                host,
                port,
            } => {
                let id = editor
                    .upsert_profile(ProfileDraft {
                        id,
                        name,
                        kind,
                        host,
                        port,
                    })
                    .await?;
                println!("{}", id);
            }
            ProfileCommand::Remove { id } => editor.delete_profile(&id).await?,
        },
        Command::Map { command } => match command {
            MapCommand::Add { host, profile } => {
                let host = if host.contains("://") {
                    editor.add_host_mapping_from_url(&host, profile.as_deref()).await?
                } else {
                    editor.add_host_mapping(&host, profile.as_deref()).await?
                };
                println!("{}", host);
            }
            MapCommand::Remove { host } => {
                if !editor.remove_host(&host).await? {
                    println!("No mapping for {}", host);
                }
            }
            MapCommand::Set { host, profile } => {
                if !editor.update_mapping_profile(&host, profile.as_deref()).await? {
                    println!("No mapping for {}", host);
                }
            }
        },
        Command::Whitelist { entries } => editor.set_whitelist(&entries.join("\n")).await?,
        Command::Default { id } => editor.set_default_profile(id.as_deref()).await?,
        Command::Switch { switch, state } => {
            let on = matches!(state, SwitchState::On);
            match switch {
                SwitchName::Master => editor.set_master_enabled(on).await?,
                SwitchName::Global => editor.set_global_proxy_enabled(on).await?,
            }
        }
        Command::Coverage { urls } => {
            let settings = editor.load().await?;
            let report = coverage(urls.iter().map(String::as_str), &settings.mappings);
            print_json(&report)?;
        }
    }

    Ok(())
}

/// Answers one URL per stdin line until EOF or Ctrl-C.
async fn serve(engine: &DecisionEngine) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("stdin closed");
                    break;
                };
                let url = line.trim();
                if url.is_empty() {
                    continue;
                }
                let verdict = engine.evaluate(&RequestDescriptor::new(url));
                print_json(&DecisionLine { url, verdict: &verdict })?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
