use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use byteautoui::config::IosConfigStore;
use byteautoui::provider::Providers;

#[derive(Parser)]
#[command(name = "byteautoui")]
#[command(version)]
#[command(about = "Local mobile UI automation service", long_about = None)]
struct Cli {
    /// Verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the local server [default]
    Server {
        /// Port number
        #[arg(long, default_value = "20242")]
        port: u16,

        /// Bind host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Shut down an already-running server first
        #[arg(short, long, default_value = "false")]
        force: bool,
    },

    /// Print version
    Version,

    /// iOS device configuration management
    IosConfig {
        #[command(subcommand)]
        command: IosConfigCommands,
    },
}

#[derive(Subcommand)]
enum IosConfigCommands {
    /// Show one device's WDA config
    Show { udid: String },

    /// Show every stored device config
    ShowAll,

    /// Set a device's WDA bundle id
    SetBundleId { udid: String, bundle_id: String },

    /// Set a device's WDA port
    SetPort { udid: String, port: u16 },

    /// Clear a device's stored config
    Clear { udid: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command.unwrap_or(Commands::Server {
        port: 20242,
        host: "127.0.0.1".to_string(),
        force: false,
    }) {
        Commands::Server { port, host, force } => {
            println!(
                "{} byteautoui version: {}",
                "▶".green().bold(),
                env!("CARGO_PKG_VERSION").cyan()
            );

            if force {
                let url = format!("http://{}:{}/shutdown", host, port);
                let client = reqwest::Client::builder()
                    .timeout(std::time::Duration::from_secs(3))
                    .build()?;
                if client.get(&url).send().await.is_ok() {
                    // Give the old instance a moment to release the port.
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
            }

            let ios_config = Arc::new(IosConfigStore::open_default()?);
            let providers = Arc::new(Providers::new(ios_config));

            println!("  Listening: {}", format!("http://{}:{}", host, port).cyan());
            println!("  Drivers: {}", "android, ios, harmony".cyan());
            println!("\n  Press Ctrl+C to stop.\n");

            byteautoui::server::serve(&host, port, providers).await?;
        }

        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }

        Commands::IosConfig { command } => {
            let store = IosConfigStore::open_default()?;
            match command {
                IosConfigCommands::Show { udid } => {
                    let (bundle_id, port) = store.device_config(&udid);
                    println!("{}:", udid);
                    println!("  wda_bundle_id: {}", bundle_id);
                    println!("  wda_port: {}", port);
                }
                IosConfigCommands::ShowAll => {
                    let all = store.all();
                    if all.is_empty() {
                        println!("No device configs stored.");
                    }
                    for (udid, _) in all {
                        let (bundle_id, port) = store.device_config(&udid);
                        println!("{}:", udid);
                        println!("  wda_bundle_id: {}", bundle_id);
                        println!("  wda_port: {}", port);
                    }
                }
                IosConfigCommands::SetBundleId { udid, bundle_id } => {
                    store.set_wda_bundle_id(&udid, &bundle_id)?;
                    println!("{} WDA bundle id saved for {}", "✓".green(), udid);
                }
                IosConfigCommands::SetPort { udid, port } => {
                    store.set_wda_port(&udid, port)?;
                    println!("{} WDA port saved for {}", "✓".green(), udid);
                }
                IosConfigCommands::Clear { udid } => {
                    store.clear_device(&udid)?;
                    println!("{} Config cleared for {}", "✓".green(), udid);
                }
            }
        }
    }

    Ok(())
}
