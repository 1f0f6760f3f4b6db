use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use burnish_agent::{ClaudeBackend, CodexBackend, OpenAiCompatBackend};
use burnish_core::agent::AgentBackend;
use burnish_core::config::{env_get, parse_dotenv, SessionConfig, StatePaths};
use burnish_core::cycle::SessionMode;
use burnish_core::db::Store;
use burnish_core::errors::EngineError;
use burnish_core::git::Git;
use burnish_core::qa::capture_baseline;
use burnish_core::qa::QaStatsStore;
use burnish_core::session::{preflight_repo, SessionSupervisor};
use burnish_core::sidecar::{load_json, push_nudge, RunState};
use burnish_core::types::{DeliveryMode, TicketStatus};

#[derive(Parser)]
#[command(name = "burnish", about = "Autonomous code-improvement orchestrator", version)]
struct Cli {
    /// Repository root (defaults to the current directory).
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.state/` with a default config and an empty store.
    Init,
    /// Check the environment: git repo, remote, clean tree, agent, auth.
    Doctor,
    /// Show ticket counts, recent cycles, and pending PRs.
    Status,
    /// Delete sidecar state (keeps config.json). Requires --yes.
    Reset {
        #[arg(long)]
        yes: bool,
    },
    /// Dump tickets, learnings, sectors, and run-state as one JSON bundle.
    Export,
    /// One scout pass against a path; survivors are parked for `approve`.
    Scout { path: String },
    /// Promote parked proposals to tickets ("all" or comma-separated indexes).
    Approve { selection: String },
    /// Execute one ticket end to end.
    Run { ticket: i64 },
    /// Reset a blocked ticket to ready and execute it again.
    Retry { ticket: i64 },
    /// Run the QA commands once and show the baseline.
    Qa,
    /// Queue a hint for the owning session's next scout.
    Nudge { text: Vec<String> },
    /// Continuous mode: scout, execute, and deliver until a stop condition.
    Auto {
        /// Time budget in minutes.
        #[arg(long)]
        minutes: Option<u64>,
        /// Cycle budget (planning mode).
        #[arg(long)]
        cycles: Option<u32>,
        #[arg(long)]
        max_prs: Option<u32>,
        #[arg(long)]
        formula: Option<String>,
        /// direct | milestone | pr | auto_merge
        #[arg(long)]
        deliver: Option<String>,
        #[arg(long)]
        parallel: Option<usize>,
        /// claude | codex | kimi | openai-local
        #[arg(long)]
        backend: Option<String>,
        /// Scout and promote only; never execute.
        #[arg(long)]
        plan_only: bool,
        #[arg(long)]
        docs_audit: bool,
    },
}

#[tokio::main]
async fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "burnish_cli=info,burnish_core=info,burnish_agent=info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let repo_root = cli
        .repo
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    match run(cli, repo_root).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Engine errors carry their own exit codes.
            if let Some(engine_err) = e.downcast_ref::<EngineError>() {
                eprintln!("error: {engine_err}");
                std::process::exit(engine_err.exit_code());
            }
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn build_backend(config: &SessionConfig, name: &str) -> Result<Arc<dyn AgentBackend>> {
    let dotenv = parse_dotenv(std::path::Path::new("."));
    match name {
        "claude" => Ok(Arc::new(ClaudeBackend::new("claude", config.model.clone()))),
        "codex" => {
            let key = env_get("CODEX_API_KEY", &dotenv)
                .or_else(|| env_get("OPENAI_API_KEY", &dotenv))
                .unwrap_or_default();
            Ok(Arc::new(CodexBackend::new(key, config.codex_model.clone())))
        }
        "kimi" => {
            let key = env_get("KIMI_API_KEY", &dotenv)
                .ok_or(EngineError::AuthMissing("kimi".into()))?;
            Ok(Arc::new(OpenAiCompatBackend::kimi(key, config.model.clone())))
        }
        "openai-local" => {
            let base = env_get("OPENAI_LOCAL_BASE_URL", &dotenv)
                .unwrap_or_else(|| "http://127.0.0.1:11434/v1".into());
            Ok(Arc::new(OpenAiCompatBackend::local(base, config.model.clone())))
        }
        other => bail!(EngineError::MissingAgent(other.to_string())),
    }
}

fn parse_delivery(s: &str) -> Result<DeliveryMode> {
    match s {
        "direct" => Ok(DeliveryMode::Direct),
        "milestone" => Ok(DeliveryMode::Milestone),
        "pr" => Ok(DeliveryMode::Pr),
        "auto_merge" | "auto-merge" => Ok(DeliveryMode::AutoMerge),
        other => bail!("unknown delivery mode: {other}"),
    }
}

async fn run(cli: Cli, repo_root: PathBuf) -> Result<i32> {
    let paths = StatePaths::new(&repo_root);
    let mut config = SessionConfig::load(&paths);

    match cli.command {
        Command::Init => {
            std::fs::create_dir_all(&paths.state_dir)?;
            config.save(&paths)?;
            let store = Store::open(&paths.db().to_string_lossy())?;
            store.migrate()?;
            let name = repo_root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "repo".into());
            store.upsert_project(&name, &repo_root.to_string_lossy())?;
            println!("initialized {}", paths.state_dir.display());
            Ok(0)
        }

        Command::Doctor => {
            let mut code = 0;
            match preflight_repo(&repo_root, &config) {
                Ok(()) => println!("repo: ok"),
                Err(e) => {
                    println!("repo: {e}");
                    code = e.exit_code();
                }
            }
            match build_backend(&config, &config.backend) {
                Ok(_) => println!("backend {}: configured", config.backend),
                Err(e) => {
                    println!("backend {}: {e}", config.backend);
                    if code == 0 {
                        code = 4;
                    }
                }
            }
            if config.qa.commands.is_empty() {
                println!("qa: no commands configured");
            } else {
                println!("qa: {} commands", config.qa.commands.len());
            }
            Ok(code)
        }

        Command::Status => {
            let store = Store::open(&paths.db().to_string_lossy())?;
            store.migrate()?;
            println!("tickets:");
            for (status, count) in store.count_tickets()? {
                println!("  {status}: {count}");
            }
            let run_state: RunState = load_json(&paths.run_state());
            println!("total cycles: {}", run_state.total_cycles);
            println!(
                "quality: {}/{} first-pass",
                run_state.quality_signals.first_pass_success, run_state.quality_signals.total_tickets
            );
            for cycle in run_state.recent_cycles.iter().rev().take(5) {
                println!(
                    "  cycle {}: sector {} | {} proposals | {} approved | {} ok / {} failed",
                    cycle.cycle,
                    cycle.sector,
                    cycle.proposals,
                    cycle.approved,
                    cycle.tickets_succeeded,
                    cycle.tickets_failed
                );
            }
            if !run_state.deferred_proposals.is_empty() {
                println!("deferred proposals: {}", run_state.deferred_proposals.len());
            }
            Ok(0)
        }

        Command::Reset { yes } => {
            if !yes {
                bail!("refusing to reset without --yes");
            }
            for path in [
                paths.db(),
                paths.run_state(),
                paths.learnings(),
                paths.qa_stats(),
                paths.qa_baseline(),
                paths.sectors(),
                paths.dedup_memory(),
                paths.file_cooldown(),
                paths.metrics(),
            ] {
                if path.exists() {
                    std::fs::remove_file(&path)?;
                    info!("removed {}", path.display());
                }
            }
            println!("state reset (config.json kept)");
            Ok(0)
        }

        Command::Export => {
            let store = Store::open(&paths.db().to_string_lossy())?;
            store.migrate()?;
            let mut tickets = Vec::new();
            for status in [
                TicketStatus::Ready,
                TicketStatus::InProgress,
                TicketStatus::Leased,
                TicketStatus::Blocked,
                TicketStatus::Done,
            ] {
                tickets.extend(store.list_tickets_by_status(status)?);
            }
            let learnings: serde_json::Value = load_json(&paths.learnings());
            let sectors: serde_json::Value = load_json(&paths.sectors());
            let run_state: serde_json::Value = load_json(&paths.run_state());
            let bundle = serde_json::json!({
                "tickets": tickets,
                "learnings": learnings,
                "sectors": sectors,
                "run_state": run_state,
            });
            println!("{}", serde_json::to_string_pretty(&bundle)?);
            Ok(0)
        }

        Command::Nudge { text } => {
            let text = text.join(" ");
            if text.is_empty() {
                bail!("empty nudge");
            }
            push_nudge(&paths.nudges(), &text)?;
            println!("queued nudge: {text}");
            Ok(0)
        }

        Command::Qa => {
            let stats = QaStatsStore::open(paths.qa_stats());
            let baseline =
                capture_baseline(&repo_root, &config.qa, &stats, &paths.qa_baseline()).await?;
            if baseline.failures.is_empty() {
                println!("baseline: all {} commands pass", config.qa.commands.len());
            } else {
                println!("baseline failures (healing targets):");
                for name in &baseline.failures {
                    println!("  {name}");
                }
            }
            Ok(0)
        }

        Command::Scout { path } => {
            preflight_repo(&repo_root, &config)?;
            let backend = build_backend(&config, &config.backend)?;
            let mut supervisor =
                SessionSupervisor::bootstrap(&repo_root, config, backend, SessionMode::Planning)
                    .await?;
            let scope = if path.contains('*') { path } else { format!("{path}/**") };
            let proposals = supervisor.engine.scout_once(&scope).await?;
            if proposals.is_empty() {
                println!("no proposals survived filtering");
            }
            for (i, p) in proposals.iter().enumerate() {
                println!(
                    "[{i}] {} ({}; confidence {}, impact {})",
                    p.title,
                    p.category.as_str(),
                    p.confidence,
                    p.impact_score
                );
            }
            Ok(0)
        }

        Command::Approve { selection } => {
            let backend = build_backend(&config, &config.backend)?;
            let mut supervisor =
                SessionSupervisor::bootstrap(&repo_root, config, backend, SessionMode::Planning)
                    .await?;
            let indexes: Vec<usize> = if selection == "all" {
                Vec::new()
            } else {
                selection
                    .split(',')
                    .map(|s| s.trim().parse().context("selection index"))
                    .collect::<Result<_>>()?
            };
            let tickets = supervisor.engine.approve_deferred(&indexes).await?;
            for ticket in &tickets {
                println!("ticket #{}: {}", ticket.id, ticket.title);
            }
            println!("{} tickets created", tickets.len());
            Ok(0)
        }

        Command::Run { ticket } => {
            preflight_repo(&repo_root, &config)?;
            let backend = build_backend(&config, &config.backend)?;
            let mut supervisor =
                SessionSupervisor::bootstrap(&repo_root, config, backend, SessionMode::Spin).await?;
            let ok = supervisor.engine.execute_single_ticket(ticket).await?;
            println!("ticket #{ticket}: {}", if ok { "success" } else { "failed" });
            Ok(if ok { 0 } else { 1 })
        }

        Command::Retry { ticket } => {
            preflight_repo(&repo_root, &config)?;
            let backend = build_backend(&config, &config.backend)?;
            let mut supervisor =
                SessionSupervisor::bootstrap(&repo_root, config, backend, SessionMode::Spin).await?;
            supervisor
                .engine
                .store
                .update_ticket_status(ticket, TicketStatus::Ready)?;
            let ok = supervisor.engine.execute_single_ticket(ticket).await?;
            println!("ticket #{ticket}: {}", if ok { "success" } else { "failed" });
            Ok(if ok { 0 } else { 1 })
        }

        Command::Auto {
            minutes,
            cycles,
            max_prs,
            formula,
            deliver,
            parallel,
            backend,
            plan_only,
            docs_audit,
        } => {
            if let Some(m) = minutes {
                config.auto.time_budget_mins = m;
            }
            if let Some(c) = cycles {
                config.auto.max_cycles = c;
            }
            if let Some(p) = max_prs {
                config.auto.max_prs = p;
            }
            if let Some(f) = formula {
                config.auto.formula = Some(f);
            }
            if let Some(d) = deliver {
                config.auto.delivery = parse_delivery(&d)?;
            }
            if let Some(p) = parallel {
                config.auto.parallel = Some(p);
            }
            if docs_audit {
                config.auto.docs_audit = true;
                config.auto.formula = Some("docs-audit".into());
            }
            let backend_name = backend.unwrap_or_else(|| config.backend.clone());
            config.backend = backend_name.clone();

            preflight_repo(&repo_root, &config)?;
            let agent = build_backend(&config, &backend_name)?;
            if !agent.supports_execution() && !plan_only {
                warn!("backend {backend_name} is scout-only; forcing planning mode");
            }
            let mode = if plan_only || !agent.supports_execution() {
                SessionMode::Planning
            } else {
                SessionMode::Spin
            };

            let mut supervisor =
                SessionSupervisor::bootstrap(&repo_root, config, agent, mode).await?;
            let summary = supervisor.run().await?;
            println!(
                "session done: {} cycles, {} PRs ({})",
                summary.cycles, summary.prs_created, summary.reason
            );
            // Verify the base branch still exists as a sanity signal.
            let git = Git::new(repo_root.to_string_lossy().into_owned());
            if let Ok(branch) = git.current_branch(&repo_root.to_string_lossy()) {
                info!("current branch after session: {branch}");
            }
            Ok(0)
        }
    }
}
