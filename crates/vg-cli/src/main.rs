mod commands;

use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};

/// vigil -- autonomous host monitoring and remediation.
#[derive(Parser)]
#[command(name = "vg", version, about)]
struct Cli {
    /// Path to the config file (default: /etc/vigil/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon continuously.
    Run,
    /// Run one probe-and-analyze cycle, then exit.
    Check,
    /// Interactive chat with the senior tier.
    Chat,
    /// Ask the senior tier a single question.
    Ask {
        /// The question (remaining arguments are joined).
        question: Vec<String>,
    },
    /// Inspect or resolve queued actions.
    Approve {
        #[command(subcommand)]
        action: Option<ApproveAction>,
    },
    /// Tail a structured log stream.
    Logs {
        /// One of: actions, decisions, queue.
        stream: String,
        /// Number of records to show.
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
    /// Inspect or edit tracked issues.
    Issues {
        #[command(subcommand)]
        action: Option<IssueAction>,
    },
    /// Send a notification through the configured sink.
    Notify {
        title: String,
        body: String,
        /// low, medium, or high (default medium).
        priority: Option<String>,
    },
}

#[derive(Subcommand)]
enum ApproveAction {
    /// List queued actions (default).
    List,
    /// Approve and execute a queued action.
    Approve { id: u64 },
    /// Reject a queued action.
    Reject { id: u64 },
    /// Attach a note to a queued action.
    Discuss { id: u64, note: Vec<String> },
}

#[derive(Subcommand)]
enum IssueAction {
    /// List issues (default).
    List,
    /// Show one issue in full.
    Show { id: String },
    /// Open an issue manually.
    Create {
        title: String,
        #[arg(long, default_value = "warning")]
        severity: String,
    },
    /// Mark an issue resolved.
    Resolve { id: String, resolution: Vec<String> },
    /// Close a resolved issue.
    Close { id: String },
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    let config = match commands::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    };
    vg_telemetry::logging::init_logging("vg", &config.general.log_level);

    let result = match cli.command {
        Commands::Run => commands::run::run(config).await,
        Commands::Check => commands::check::run(config).await,
        Commands::Chat => commands::chat::run(config).await,
        Commands::Ask { question } => commands::ask::run(config, &question.join(" ")).await,
        Commands::Approve { action } => commands::approve::run(config, action).await,
        Commands::Logs { stream, lines } => commands::logs::run(config, &stream, lines).await,
        Commands::Issues { action } => commands::issues::run(config, action).await,
        Commands::Notify {
            title,
            body,
            priority,
        } => commands::notify::run(config, &title, &body, priority.as_deref()).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(2);
    }
}
