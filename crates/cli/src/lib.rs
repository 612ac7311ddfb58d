pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use cadence_core::config::{ConfigOverrides, LoadOptions};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "cadence",
    about = "Cadence operator CLI",
    long_about = "Inspect configuration, apply migrations, and dry-run the rule matcher, \
                  touch scheduler and handover evaluator against a playbook.",
    after_help = "Examples:\n  cadence doctor --json\n  cadence classify message.json\n  \
                  cadence schedule new-inquiry --start 2026-03-02T09:00:00Z"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a cadence.toml config file")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Playbook file to use instead of the configured one")]
    playbook: Option<PathBuf>,
    #[arg(long, global = true, help = "Log level for diagnostics written to stderr")]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, playbook and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Run the trigger rules against an inbound message JSON file")]
    Classify { message: PathBuf },
    #[command(about = "Print the cumulative due time of every touch in a campaign")]
    Schedule {
        campaign_id: String,
        #[arg(long, help = "Enrollment start as an RFC 3339 timestamp")]
        start: String,
        #[arg(long, help = "Campaign revision; defaults to the latest")]
        revision: Option<u32>,
    },
    #[command(about = "Evaluate handover for a lead snapshot and render the dossier")]
    Evaluate { input: PathBuf },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Migrate => "migrate",
            Self::Config => "config",
            Self::Doctor { .. } => "doctor",
            Self::Classify { .. } => "classify",
            Self::Schedule { .. } => "schedule",
            Self::Evaluate { .. } => "evaluate",
        }
    }
}

impl Cli {
    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            config_path: self.config.clone(),
            require_file: self.config.is_some(),
            overrides: ConfigOverrides {
                playbook_path: self.playbook.clone(),
                log_level: self.log_level.clone(),
                ..ConfigOverrides::default()
            },
        }
    }
}

fn init_logging(level: Option<&str>) {
    let filter = tracing_subscriber::EnvFilter::try_new(level.unwrap_or("warn"))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    let options = cli.load_options();

    let result = match &cli.command {
        Command::Migrate => commands::migrate::run(&options),
        Command::Config => commands::config::run(&options),
        Command::Doctor { json } => commands::doctor::run(&options, *json),
        Command::Classify { message } => commands::classify::run(&options, message),
        Command::Schedule { campaign_id, start, revision } => {
            commands::schedule::run(&options, campaign_id, start, *revision)
        }
        Command::Evaluate { input } => commands::evaluate::run(&options, input),
    };

    if result.exit_code != 0 {
        tracing::debug!(
            event_name = "cli.command_failed",
            command = cli.command.name(),
            exit_code = result.exit_code,
            "command finished with a failure status"
        );
    }
    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
