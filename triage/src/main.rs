//! Failed-build triage for CI.
//!
//! `triage run` handles one build event and writes `agent-result.json`:
//! a failed main build opens a fix session, a failed fix branch retries or
//! escalates, and a green fix branch gets its pull request.

use std::env;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{debug, warn};

use triage::core::case::fix_id_from_branch;
use triage::core::signature::error_signature;
use triage::core::types::{BuildEvent, BuildStatus, RunOutcome};
use triage::exit_codes;
use triage::io::config::{DEFAULT_CONFIG_PATH, TriageConfig, load_config, write_config};
use triage::io::evidence::{LocalEvidenceBroker, RemoteSource};
use triage::io::failure_log::read_failure_excerpt;
use triage::io::gh::Gh;
use triage::io::git::{Git, Identity};
use triage::io::publisher::GitHubPublisher;
use triage::io::reasoning::CommandEngine;
use triage::io::report::{DEFAULT_OUTCOME_PATH, summary_line, write_outcome};
use triage::io::tracker::GhTracker;
use triage::ledger::{AttemptLedger, BranchHistory, LedgerSnapshot};
use triage::logging;
use triage::orchestrator::{Collaborators, Orchestrator};

#[derive(Parser)]
#[command(name = "triage", version, about = "Autonomous triage of failed CI builds")]
struct Cli {
    /// Debug-level diagnostics for triage on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Config file; defaults apply when it is missing.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Handle one build event and write the run outcome.
    Run(RunArgs),
    /// Print the attempt ledger of a branch as JSON.
    Attempts {
        #[arg(long)]
        branch: String,
    },
    /// Print the error signature and class of a build log.
    Signature {
        #[arg(long)]
        failure_log: PathBuf,
    },
    /// Write the default config file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Branch the build ran on.
    #[arg(long)]
    branch: String,
    #[arg(long, value_enum)]
    build_status: StatusArg,
    /// Captured build log.
    #[arg(long)]
    failure_log: Option<PathBuf>,
    /// Build flavor; falls back to `BUILD_FLAVOR`.
    #[arg(long)]
    flavor: Option<String>,
    /// Commit under test; falls back to `GITHUB_SHA`.
    #[arg(long)]
    commit: Option<String>,
    #[arg(long, default_value = DEFAULT_OUTCOME_PATH)]
    output: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StatusArg {
    Success,
    Failure,
}

impl From<StatusArg> for BuildStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Success => BuildStatus::Success,
            StatusArg::Failure => BuildStatus::Failure,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match dispatch(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(exit_codes::ERROR);
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => cmd_run(&cli.config, args),
        Command::Attempts { branch } => cmd_attempts(&cli.config, &branch),
        Command::Signature { failure_log } => cmd_signature(&cli.config, &failure_log),
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
    }
}

/// Non-empty environment variable.
fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn cmd_run(config_path: &Path, args: RunArgs) -> Result<i32> {
    let event = BuildEvent {
        branch_name: args.branch,
        build_status: args.build_status.into(),
        failure_log: args.failure_log,
        flavor: args.flavor.or_else(|| env_var("BUILD_FLAVOR")),
        commit_sha: args.commit.or_else(|| env_var("GITHUB_SHA")),
    };

    let outcome = match load_config(config_path) {
        Ok(cfg) => run_event(&cfg, &event),
        Err(err) => RunOutcome::error(0, format!("{err:#}")),
    };
    write_outcome(&args.output, &outcome)?;
    println!("{}", summary_line(&outcome));

    Ok(if outcome.success {
        exit_codes::OK
    } else {
        exit_codes::ERROR
    })
}

/// Wire the real collaborators around the working directory and handle the event.
fn run_event(cfg: &TriageConfig, event: &BuildEvent) -> RunOutcome {
    let workdir = Path::new(".");
    let timeouts = &cfg.timeouts;
    let repo = cfg
        .evidence
        .remote_repo
        .clone()
        .or_else(|| env_var("GITHUB_REPOSITORY"));

    let git = Git::new(workdir, timeouts.git());
    let commit_sha = event.commit_sha.clone().or_else(|| git.head_sha().ok());
    let remote = commit_sha.map(|commit_sha| RemoteSource {
        gh: Gh::new(repo.clone(), workdir, timeouts.evidence()),
        commit_sha,
    });
    let evidence = match LocalEvidenceBroker::new(
        workdir,
        git.clone(),
        cfg.evidence.max_file_bytes,
        remote,
    ) {
        Ok(broker) => broker,
        Err(err) => return RunOutcome::error(0, format!("{err:#}")),
    };

    let engine = CommandEngine::new(
        cfg.engine.command.clone(),
        workdir,
        timeouts.engine(),
        cfg.engine.output_limit_bytes,
    );
    let tracker = GhTracker::new(Gh::new(repo.clone(), workdir, timeouts.tracker()));
    let publisher = GitHubPublisher::new(
        git.clone(),
        Gh::new(repo, workdir, timeouts.tracker()),
        Identity {
            name: cfg.agent_name.clone(),
            email: cfg.agent_email.clone(),
        },
        cfg.base_branch.clone(),
    );

    let run_id = env_var("GITHUB_RUN_ID");
    if run_id.is_none() {
        warn!("GITHUB_RUN_ID is not set, new fix ids will be local");
    }
    debug!(run_id = ?run_id, "wired collaborators");

    let orchestrator = Orchestrator::new(
        cfg,
        Collaborators {
            engine: &engine,
            evidence: &evidence,
            tracker: &tracker,
            publisher: &publisher,
            history: &git,
        },
        run_id,
    );
    orchestrator.handle(event)
}

#[derive(Serialize)]
struct AttemptsReport<'a> {
    branch: &'a str,
    fix_id: Option<&'a str>,
    #[serde(flatten)]
    ledger: LedgerSnapshot,
}

fn cmd_attempts(config_path: &Path, branch: &str) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let git = Git::new(".", cfg.timeouts.git());
    let history = BranchHistory { git: &git, branch };
    let ledger = AttemptLedger::new(&history, &cfg.agent_name, &cfg.base_branch).read()?;
    let report = AttemptsReport {
        branch,
        fix_id: fix_id_from_branch(branch, &cfg.fix_branch_prefix),
        ledger,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(exit_codes::OK)
}

fn cmd_signature(config_path: &Path, failure_log: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let excerpt = read_failure_excerpt(Some(failure_log), cfg.excerpt_limits());
    println!(
        "{} {} {}",
        error_signature(&excerpt.excerpt),
        excerpt.error_type,
        excerpt.location
    );
    Ok(exit_codes::OK)
}

fn cmd_init_config(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    write_config(config_path, &TriageConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}
