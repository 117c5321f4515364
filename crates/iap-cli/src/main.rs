use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "iap")]
#[command(about = "In-app purchase reconciliation tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> overrides...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Drive a scripted provider callback stream through the runtime against
    /// the paper store; prints every bus event as one JSON line.
    Replay {
        /// Layered config paths in merge order
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        /// JSON replay script
        #[arg(long)]
        script: String,

        /// Fail when the config carries keys nothing reads
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
}

fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    // stdout carries replay output; logs go to stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    // Best-effort; a missing file is fine.
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();

    match cli.cmd {
        Commands::ConfigHash { paths } => {
            init_tracing("info");
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = iap_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Replay {
            config_paths,
            script,
            strict,
        } => {
            commands::replay::run(&config_paths, &script, strict, init_tracing)?;
        }
    }

    Ok(())
}
