use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use rom_patcher::config::{self, FileSettings, Settings, SettingsProvider};
use rom_patcher::events::TracingSink;
use rom_patcher::listener::{self, Listener};
use rom_patcher::pipeline;
use rom_patcher::protocol::{self, PatchBody};
use rom_patcher::source::{PatchRequest, PatchSource};
use rom_patcher::util;

#[derive(Parser)]
#[command(
    name = "rom-patcher",
    version,
    about = "Apply BPS patches to a base ROM and open the result in an emulator"
)]
struct Cli {
    /// Settings file (default: per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for patch requests on the loopback interface
    Serve {
        /// Port to listen on (overrides the settings file)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Patch the base ROM with a local file or URL
    Apply {
        /// Path or http(s) URL of a .bps patch or a .zip containing one
        source: String,
        /// Name for the patched ROM (default: patch file name)
        #[arg(long)]
        name: Option<String>,
        /// Save the ROM without starting the emulator
        #[arg(long)]
        no_launch: bool,
    },
    /// Send a patch request to a running listener
    Submit {
        /// Path or http(s) URL of the patch
        source: String,
        #[arg(long)]
        name: Option<String>,
        /// Listener port (default: from the settings file)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the current settings
    Config {
        /// Write a settings file with default values if none exists
        #[arg(long)]
        init: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "rom_patcher=debug,info" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn is_url(source: &str) -> bool {
    source.contains("://")
}

/// Display name implied by a patch path or URL: its file stem.
fn name_from_source(source: &str) -> Option<String> {
    let last = if is_url(source) {
        source
            .split(['?', '#'])
            .next()?
            .rsplit('/')
            .find(|s| !s.is_empty())?
    } else {
        Path::new(source).file_name()?.to_str()?
    };
    Path::new(last)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config_path = cli.config.unwrap_or_else(config::default_path);

    match cli.command {
        Commands::Serve { port } => {
            let provider = FileSettings::open(config_path.clone())?;
            let port = port.unwrap_or(provider.initial().port);
            if provider.initial().base_rom.is_none() {
                tracing::warn!(
                    "no base ROM configured in {}; requests will fail until it is set",
                    config_path.display()
                );
            }
            let provider: Arc<dyn SettingsProvider> = Arc::new(provider);
            let listener =
                Listener::bind(listener::loopback(port), provider, Arc::new(TracingSink)).await?;
            listener
                .serve(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("failed to wait for Ctrl-C: {e}");
                        std::future::pending::<()>().await;
                    }
                })
                .await?;
        }
        Commands::Apply {
            source,
            name,
            no_launch,
        } => {
            let mut settings = config::load_from(&config_path)?;
            if no_launch {
                settings.launch_emulator = false;
            }
            let request = PatchRequest {
                name: name.or_else(|| name_from_source(&source)),
                source: if is_url(&source) {
                    PatchSource::RemoteUrl(source)
                } else {
                    PatchSource::LocalPath(PathBuf::from(source))
                },
            };

            println!("Applying patch...");
            println!("  Source: {}", request.source.describe());
            let start = Instant::now();
            let outcome = pipeline::run(0, request, Arc::new(settings), &TracingSink)
                .await
                .map_err(|e| anyhow::anyhow!("{}\n  {e}", e.user_message()))?;
            let elapsed = start.elapsed();

            println!("\n{}", outcome.summary());
            println!(
                "  Size: {} ({})",
                util::format_bytes(outcome.output.size),
                outcome.output.fingerprint
            );
            if let Some(metadata) = &outcome.metadata {
                println!("  Patch metadata: {metadata}");
            }
            if let Some(readme) = &outcome.readme {
                println!("\n{readme}");
            }
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
            if let Err(e) = outcome.launch {
                bail!("{}", e.user_message());
            }
        }
        Commands::Submit { source, name, port } => {
            let settings = config::load_from(&config_path)?;
            let name = name.or_else(|| name_from_source(&source));
            // Local files travel inline; listeners refuse paths by default.
            let mut body = if is_url(&source) {
                PatchBody::url(source)
            } else {
                let bytes = tokio::fs::read(&source)
                    .await
                    .with_context(|| format!("Failed to read patch: {source}"))?;
                PatchBody::inline(&bytes)
            };
            body.name = name;
            let addr = listener::loopback(port.unwrap_or(settings.port));
            let response = protocol::send(addr, &body).await?;

            println!("{}", response.message);
            if let Some(path) = &response.output_path {
                println!("  Output: {}", path.display());
            }
            if let Some(readme) = &response.readme {
                println!("\n{readme}");
            }
            if !response.is_ok() {
                bail!(
                    "request failed ({})",
                    response.error_kind.as_deref().unwrap_or("unknown")
                );
            }
        }
        Commands::Config { init } => {
            if init {
                if config_path.exists() {
                    println!("Settings already exist at {}", config_path.display());
                } else {
                    config::save_to(&config_path, &Settings::default())?;
                    println!("Wrote default settings to {}", config_path.display());
                }
            }
            let settings = config::load_from(&config_path)?;
            println!("# {}", config_path.display());
            print!(
                "{}",
                toml::to_string_pretty(&settings).context("Failed to serialize settings")?
            );
        }
    }

    Ok(())
}
