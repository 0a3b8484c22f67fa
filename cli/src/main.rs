use std::path::PathBuf;
use std::process::ExitCode;

use ambient_core::AmbientConfig;
use ambient_core::AmbientEvent;
use ambient_core::Coordinator;
use ambient_core::CycleStatus;
use ambient_core::EventKind;
use ambient_core::approval::AlwaysApproveHandler;
use ambient_core::approval::AlwaysRejectHandler;
use ambient_core::approval::ApprovalHandler;
use ambient_core::approval::InteractiveApprovalHandler;
use ambient_core::approval::WebhookApprovalHandler;
use ambient_core::config::CONFIG_FILE_NAME;
use ambient_core::config::DEFAULT_CONFIG_YAML;
use ambient_core::model_client::ModelClient;
use ambient_core::status::compute_status;
use ambient_core::telemetry::TelemetrySink;
use ambient_core::workspace::Workspace;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ambient", version, about = "Ambient code-quality coordinator")]
struct Cli {
    /// Repository root to operate on.
    #[arg(long, default_value = ".", global = true)]
    repo: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the repository and run analysis cycles continuously.
    Watch {
        /// Approve every gated proposal without prompting.
        #[arg(long, default_value_t = false)]
        auto_approve: bool,
        /// Reject everything; cycles run but the repo is never touched.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Run a single analysis cycle and exit.
    RunOnce {
        #[arg(long, default_value_t = false)]
        auto_approve: bool,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Event kind to synthesize (default: periodic-scan).
        #[arg(long, value_enum)]
        event: Option<EventKindArg>,
    },
    /// Run the verification checks in the sandbox against the current tree.
    Verify,
    /// Probe the sandbox boundary and the model endpoint.
    Doctor,
    /// Print the repository context agents would receive.
    DebugContext,
    /// Write a starter configuration file.
    Init,
    /// Show windowed metrics derived from the telemetry log.
    Status {
        /// Exit 0/1 based on a health verdict instead of printing metrics.
        #[arg(long, default_value_t = false)]
        health: bool,
        #[arg(long, default_value_t = 3600)]
        window_seconds: u64,
    },
    /// Telemetry log helpers.
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommand,
    },
}

#[derive(Subcommand)]
enum TelemetryCommand {
    /// Print the last records of the telemetry log.
    Tail {
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "kebab-case")]
enum EventKindArg {
    FileChange,
    CiFailure,
    PeriodicScan,
    ManualTrigger,
    Debug,
}

impl From<EventKindArg> for EventKind {
    fn from(value: EventKindArg) -> Self {
        match value {
            EventKindArg::FileChange => EventKind::FileChange,
            EventKindArg::CiFailure => EventKind::CiFailure,
            EventKindArg::PeriodicScan => EventKind::PeriodicScan,
            EventKindArg::ManualTrigger => EventKind::ManualTrigger,
            EventKindArg::Debug => EventKind::Debug,
        }
    }
}

fn build_approval(
    config: &AmbientConfig,
    auto_approve: bool,
    dry_run: bool,
) -> Box<dyn ApprovalHandler> {
    if dry_run {
        return Box::new(AlwaysRejectHandler);
    }
    if auto_approve {
        return Box::new(AlwaysApproveHandler);
    }
    if let Some(webhook) = WebhookApprovalHandler::from_config(&config.approval.webhook) {
        return Box::new(webhook);
    }
    Box::new(InteractiveApprovalHandler)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let repo = cli.repo.canonicalize().unwrap_or(cli.repo.clone());
    let config = AmbientConfig::load(&repo)?;

    match cli.command {
        Command::Watch {
            auto_approve,
            dry_run,
        } => {
            let approval = build_approval(&config, auto_approve, dry_run);
            let mut coordinator = Coordinator::new(&repo, config, approval);
            coordinator.start().await?;
            Ok(ExitCode::SUCCESS)
        }

        Command::RunOnce {
            auto_approve,
            dry_run,
            event,
        } => {
            let approval = build_approval(&config, auto_approve, dry_run);
            let mut coordinator = Coordinator::new(&repo, config, approval);
            let event = event.map(|kind| {
                AmbientEvent::new(
                    kind.into(),
                    serde_json::json!({}),
                    serde_json::json!({"goal": "Single analysis cycle", "trigger": "manual"}),
                )
            });
            let outcome = coordinator.run_once(event).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if outcome.status == CycleStatus::Error {
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Verify => {
            let workspace = Workspace::new(&repo, &config);
            let result = workspace.verify_changes().await;
            for check in &result.results {
                let verdict = if check.ok { "ok" } else { "FAIL" };
                println!(
                    "{verdict:>4}  {} (exit {}, {:.1}s)",
                    check.name, check.exit_code, check.duration_s
                );
                if !check.ok && !check.stderr.is_empty() {
                    eprintln!("{}", check.stderr);
                }
            }
            if result.results.is_empty() {
                println!("no verification checks detected");
            }
            Ok(if result.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Command::Doctor => {
            let workspace = Workspace::new(&repo, &config);
            let probes = workspace.doctor().await;
            let mut all_ok = true;
            for probe in &probes {
                let verdict = if probe.ok { "ok" } else { "FAIL" };
                println!("{verdict:>4}  {}", probe.name);
                all_ok &= probe.ok;
            }

            let client = ModelClient::new(config.model.clone());
            let model_ok = client.health_check().await;
            println!(
                "{:>4}  model endpoint {}",
                if model_ok { "ok" } else { "FAIL" },
                config.model.base_url
            );
            all_ok &= model_ok;

            Ok(if all_ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Command::DebugContext => {
            let workspace = Workspace::new(&repo, &config);
            let context = workspace.build_context(&AmbientEvent::periodic_scan()).await?;
            let summary = serde_json::json!({
                "task": context.task,
                "total_files": context.tree.total_files,
                "important_files": context.important_files.keys().collect::<Vec<_>>(),
                "impact_sources": context.impact_sources.keys().collect::<Vec<_>>(),
                "hot_paths": context.hot_paths,
                "current_diff_bytes": context.current_diff.len(),
                "failing_logs_bytes": context.failing_logs.len(),
                "conventions": context.conventions,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(ExitCode::SUCCESS)
        }

        Command::Init => {
            let config_path = repo.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                eprintln!("{} already exists", config_path.display());
                return Ok(ExitCode::FAILURE);
            }
            std::fs::write(&config_path, DEFAULT_CONFIG_YAML)?;
            println!("wrote {}", config_path.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::Status {
            health,
            window_seconds,
        } => {
            let sink = TelemetrySink::new(&repo, &config.telemetry);
            let report = compute_status(sink.path(), window_seconds as f64);
            if health {
                let healthy = report.healthy();
                println!("{}", if healthy { "healthy" } else { "unhealthy" });
                return Ok(if healthy {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                });
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }

        Command::Telemetry { command } => match command {
            TelemetryCommand::Tail { lines } => {
                let sink = TelemetrySink::new(&repo, &config.telemetry);
                let contents = std::fs::read_to_string(sink.path()).unwrap_or_default();
                let all: Vec<&str> = contents.lines().collect();
                let start = all.len().saturating_sub(lines);
                for line in &all[start..] {
                    println!("{line}");
                }
                Ok(ExitCode::SUCCESS)
            }
        },
    }
}
