//! Reliquary run tracker CLI.
//!
//! Operates on the `.reliquary/` project in `--project-dir` (default: the
//! current directory). Every command prints pretty JSON on stdout; failures go
//! to stderr with a stable exit code from [`reliquary::exit_codes`].

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use reliquary::core::projection::RunFilter;
use reliquary::core::status::RunStatus;
use reliquary::core::types::{EvidenceInput, EvidenceKind, NewRun};
use reliquary::error::EngineError;
use reliquary::exit_codes;
use reliquary::io::init::{InitOptions, init_reliquary};
use reliquary::project::open_project;

#[derive(Parser)]
#[command(
    name = "reliquary",
    version,
    about = "Run tracking and approval workflow for autonomous work items"
)]
struct Cli {
    /// Project root containing `.reliquary/`.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    project_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.reliquary/` scaffolding and the default config.
    Init {
        /// Rewrite the config if `.reliquary/` already exists.
        #[arg(short, long)]
        force: bool,
    },
    /// Start tracking a work item.
    Create {
        work_item_id: String,
        #[arg(long)]
        repo: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        task: String,
    },
    /// Record one implementation attempt.
    Attempt {
        work_item_id: String,
        #[arg(long, value_enum)]
        outcome: Outcome,
        /// Evidence as `KIND=PAYLOAD_REF` (kinds: test_run, lint_run, patch, note, artifact).
        #[arg(long = "evidence", value_parser = parse_evidence)]
        evidence: Vec<EvidenceInput>,
    },
    /// Pause the run until a human answers `question`.
    RequestInfo { work_item_id: String, question: String },
    /// Answer the pending question and resume the run.
    ProvideInfo { work_item_id: String, answer: String },
    /// Ask a human to approve the result.
    RequestApproval { work_item_id: String },
    /// Approve a run waiting for approval.
    Approve {
        work_item_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Reject a run waiting for approval.
    Reject {
        work_item_id: String,
        #[arg(long)]
        reason: String,
    },
    /// Block a run with an explicit failure mode.
    Fail {
        work_item_id: String,
        failure_mode: String,
    },
    /// Rebuild a run flagged inconsistent from its decision log.
    Reconcile { work_item_id: String },
    /// List runs in dashboard order.
    List {
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        status: Option<RunStatus>,
        #[arg(long)]
        failure_mode: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Print a run record.
    Show { work_item_id: String },
    /// Print a run's evidence entries.
    Evidence { work_item_id: String },
    /// Print a run's decision log.
    Log { work_item_id: String },
    /// Verify a run's hash chain and record/log invariants.
    Verify { work_item_id: String },
    /// Print aggregate statistics.
    Stats,
}

#[derive(Clone, Copy, ValueEnum)]
enum Outcome {
    Success,
    Failure,
}

fn main() {
    reliquary::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            let code = err
                .downcast_ref::<EngineError>()
                .map_or(exit_codes::INVALID, EngineError::exit_code);
            std::process::exit(code);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.project_dir.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Create {
            work_item_id,
            repo,
            title,
            task,
        } => {
            let project = open_project(root)?;
            print_json(&project.engine.create_run(NewRun {
                work_item_id,
                repo_name: repo,
                ticket_title: title,
                task_raw: task,
            })?)
        }
        Command::Attempt {
            work_item_id,
            outcome,
            evidence,
        } => {
            let project = open_project(root)?;
            let success = matches!(outcome, Outcome::Success);
            print_json(&project.engine.record_attempt(&work_item_id, success, evidence)?)
        }
        Command::RequestInfo {
            work_item_id,
            question,
        } => {
            let project = open_project(root)?;
            print_json(&project.engine.request_info(&work_item_id, &question)?)
        }
        Command::ProvideInfo {
            work_item_id,
            answer,
        } => {
            let project = open_project(root)?;
            print_json(&project.engine.provide_info(&work_item_id, &answer)?)
        }
        Command::RequestApproval { work_item_id } => {
            let project = open_project(root)?;
            print_json(&project.engine.request_approval(&work_item_id)?)
        }
        Command::Approve {
            work_item_id,
            reason,
        } => {
            let project = open_project(root)?;
            print_json(
                &project
                    .engine
                    .decide_approval(&work_item_id, true, reason.as_deref())?,
            )
        }
        Command::Reject {
            work_item_id,
            reason,
        } => {
            let project = open_project(root)?;
            print_json(
                &project
                    .engine
                    .decide_approval(&work_item_id, false, Some(&reason))?,
            )
        }
        Command::Fail {
            work_item_id,
            failure_mode,
        } => {
            let project = open_project(root)?;
            print_json(&project.engine.fail_run(&work_item_id, &failure_mode)?)
        }
        Command::Reconcile { work_item_id } => {
            let project = open_project(root)?;
            print_json(&project.engine.reconcile(&work_item_id)?)
        }
        Command::List {
            repo,
            status,
            failure_mode,
            limit,
            offset,
        } => {
            let project = open_project(root)?;
            let filter = RunFilter {
                repo,
                status,
                failure_mode,
            };
            print_json(&project.query.list_runs(&filter, limit, offset)?)
        }
        Command::Show { work_item_id } => {
            let project = open_project(root)?;
            print_json(&project.query.get_run(&work_item_id)?)
        }
        Command::Evidence { work_item_id } => {
            let project = open_project(root)?;
            print_json(&project.query.get_evidence(&work_item_id)?)
        }
        Command::Log { work_item_id } => {
            let project = open_project(root)?;
            print_json(&project.query.get_decision_log(&work_item_id)?)
        }
        Command::Verify { work_item_id } => {
            let project = open_project(root)?;
            let report = project.query.verify_decision_log(&work_item_id)?;
            print_json(&report)?;
            Ok(if report.valid {
                exit_codes::OK
            } else {
                exit_codes::INCONSISTENT
            })
        }
        Command::Stats => {
            let project = open_project(root)?;
            print_json(&project.query.get_stats()?)
        }
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_reliquary(root, &InitOptions { force })?;
    println!("{}", paths.reliquary_dir.display());
    Ok(exit_codes::OK)
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<i32> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(exit_codes::OK)
}

fn parse_evidence(raw: &str) -> Result<EvidenceInput, String> {
    let (kind, payload_ref) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KIND=PAYLOAD_REF, got '{raw}'"))?;
    let kind = EvidenceKind::parse(kind.trim())
        .ok_or_else(|| format!("unknown evidence kind '{}'", kind.trim()))?;
    let payload_ref = payload_ref.trim();
    if payload_ref.is_empty() {
        return Err("evidence payload_ref must not be empty".to_string());
    }
    Ok(EvidenceInput {
        kind,
        payload_ref: payload_ref.to_string(),
        summary: None,
        exit_code: None,
    })
}
