mod db_commands;
mod job_commands;

use std::path::PathBuf;

use {
    cadence_config::CadenceConfig,
    clap::{Parser, Subcommand},
    tracing::debug,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "cadence", about = "Cadence: run scheduled jobs from an external trigger")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery of ./cadence.toml and ~/.config/cadence/).
    #[arg(long, global = true, env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured job that is due, or only the named ones.
    Run {
        /// Job codes to run. Empty means all configured jobs.
        codes: Vec<String>,
        /// Run even if the schedule says the job is not due.
        #[arg(long)]
        force: bool,
        /// Do not log when a job is skipped because its lock is held.
        #[arg(long)]
        silent: bool,
    },
    /// Validate job registrations.
    Check,
    /// Show recent runs of a job.
    History {
        code: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Release a job's lock by hand.
    Unlock { code: String },
    /// Ledger database management.
    Db {
        #[command(subcommand)]
        action: db_commands::DbAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<CadenceConfig> {
    match &cli.config {
        Some(path) => cadence_config::load_config(path),
        None => cadence_config::discover_and_load(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    debug!(version = env!("CARGO_PKG_VERSION"), "cadence starting");
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run {
            codes,
            force,
            silent,
        } => job_commands::handle_run(&config, &codes, force, silent).await,
        Commands::Check => job_commands::handle_check(&config),
        Commands::History { code, limit } => {
            job_commands::handle_history(&config, &code, limit).await
        },
        Commands::Unlock { code } => job_commands::handle_unlock(&config, &code).await,
        Commands::Db { action } => db_commands::handle_db(&config, action).await,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_codes_and_flags() {
        let cli = Cli::try_parse_from(["cadence", "run", "a", "b", "--force", "--silent"]).unwrap();
        let Commands::Run {
            codes,
            force,
            silent,
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(codes, ["a", "b"]);
        assert!(force && silent);
    }

    #[test]
    fn run_without_codes_selects_everything() {
        let cli = Cli::try_parse_from(["cadence", "run"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { codes, .. } if codes.is_empty()));
    }

    #[test]
    fn history_limit_defaults() {
        let cli = Cli::try_parse_from(["cadence", "history", "x"]).unwrap();
        assert!(matches!(cli.command, Commands::History { limit: 20, .. }));
    }
}
