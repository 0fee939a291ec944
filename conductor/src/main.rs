//! Conductor: runs a task list of AI-assisted code changes against a git repository.
//!
//! Configuration lives in `.conductor/config.toml`; run artifacts land in
//! `.conductor/runs/<ticket>/<run-id>/`.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use conductor::core::types::{TaskStatus, Verdict};
use conductor::core::verdict::parse_verdict;
use conductor::events::{EventSink, JsonLinesSink, TracingSink};
use conductor::exit_codes;
use conductor::io::backend::CommandBackend;
use conductor::io::baseline::{Baseline, BaselineGuard, STATE_DIR, ensure_state_ignored};
use conductor::io::config::{
    AttentionMode, DirtyTreePolicy, EngineConfig, load_config, write_config,
};
use conductor::io::test_runner::CommandTestRunner;
use conductor::logging;
use conductor::planner::{BackendPlanner, Planner};
use conductor::retry::RetryPolicy;
use conductor::review::{
    AttentionDecider, AttentionDecision, BackendReviewer, FixedDecider, StdinDecider,
};
use conductor::workflow::{
    Collaborators, RunSummary, WorkflowInput, check_task_list, run_workflow,
};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Phased, reviewed execution of AI-assisted code changes"
)]
struct Cli {
    /// Repository to operate on.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    workdir: PathBuf,
    /// Config file (default: `<workdir>/.conductor/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `.conductor/config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Parse a task list and print the execution schedule.
    Validate {
        #[arg(long)]
        tasks: PathBuf,
        /// Worker count to validate against (default: from config).
        #[arg(long)]
        parallel: Option<usize>,
    },
    /// Execute a task list.
    Run(RunArgs),
    /// Parse review text and print its verdict (stdin when no file is given).
    Verdict { file: Option<PathBuf> },
    /// Reset the working tree to a baseline commit, dropping untracked files.
    Restore { commit: String },
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(long)]
    ticket: String,
    #[arg(long)]
    tasks: PathBuf,
    #[arg(long)]
    plan: Option<PathBuf>,
    /// Regenerate the task list through the backend on NEEDS_REPLAN.
    #[arg(long)]
    auto_replan: bool,
    #[arg(long)]
    parallel: Option<usize>,
    /// Let every parallel task finish even after one fails.
    #[arg(long)]
    no_fail_fast: bool,
    #[arg(long)]
    max_self_corrections: Option<u32>,
    #[arg(long)]
    max_autofix: Option<u32>,
    #[arg(long)]
    no_review: bool,
    /// Start on a dirty working tree (warn instead of failing).
    #[arg(long)]
    allow_dirty: bool,
    #[arg(long, value_enum)]
    on_attention: Option<AttentionArg>,
    /// Print progress events as JSON lines on stdout.
    #[arg(long)]
    events_jsonl: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AttentionArg {
    Prompt,
    Continue,
    Stop,
}

impl From<AttentionArg> for AttentionMode {
    fn from(arg: AttentionArg) -> Self {
        match arg {
            AttentionArg::Prompt => AttentionMode::Prompt,
            AttentionArg::Continue => AttentionMode::Continue,
            AttentionArg::Stop => AttentionMode::Stop,
        }
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.workdir.join(STATE_DIR).join("config.toml"));
    match cli.command {
        Command::Init { force } => cmd_init(&cli.workdir, &config_path, force),
        Command::Validate { tasks, parallel } => {
            let config = load_config(&config_path)?;
            cmd_validate(&tasks, parallel.unwrap_or(config.max_parallel))
        }
        Command::Run(args) => {
            let mut config = load_config(&config_path)?;
            apply_overrides(&mut config, &args);
            config.validate()?;
            cmd_run(&cli.workdir, &config, &args)
        }
        Command::Verdict { file } => cmd_verdict(file.as_deref()),
        Command::Restore { commit } => cmd_restore(&cli.workdir, &commit),
    }
}

fn apply_overrides(config: &mut EngineConfig, args: &RunArgs) {
    if let Some(n) = args.parallel {
        config.max_parallel = n;
    }
    if args.no_fail_fast {
        config.fail_fast = false;
    }
    if let Some(n) = args.max_self_corrections {
        config.max_self_corrections = n;
    }
    if let Some(n) = args.max_autofix {
        config.max_autofix_attempts = n;
    }
    if args.no_review {
        config.review_enabled = false;
    }
    if args.allow_dirty {
        config.dirty_tree_policy = DirtyTreePolicy::Warn;
    }
    if let Some(mode) = args.on_attention {
        config.on_attention = mode.into();
    }
}

fn cmd_init(workdir: &Path, config_path: &Path, force: bool) -> Result<i32> {
    ensure_state_ignored(workdir)?;
    if config_path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", config_path.display());
        return Ok(exit_codes::OK);
    }
    write_config(config_path, &EngineConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(tasks: &Path, parallel: usize) -> Result<i32> {
    let document = read_text(tasks)?;
    let list = check_task_list(&document, parallel)?;

    let sequential: Vec<_> = list
        .fundamental()
        .into_iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .collect();
    println!("phase 1 (sequential): {} task(s)", sequential.len());
    for task in sequential {
        println!(
            "  {}. {} [{}]",
            task.order.unwrap_or_default(),
            task.name,
            join_files(&task.files)
        );
    }
    let parallel_tasks: Vec<_> = list
        .independent()
        .into_iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .collect();
    println!(
        "phase 2 (parallel, up to {parallel} workers): {} task(s)",
        parallel_tasks.len()
    );
    for task in parallel_tasks {
        println!(
            "  ({}) {} [{}]",
            task.group.as_deref().unwrap_or("default"),
            task.name,
            join_files(&task.files)
        );
    }
    let done: Vec<&str> = list
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| t.name.as_str())
        .collect();
    if !done.is_empty() {
        println!("already done: {}", done.join(", "));
    }
    Ok(exit_codes::OK)
}

fn cmd_run(workdir: &Path, config: &EngineConfig, args: &RunArgs) -> Result<i32> {
    let task_list = read_text(&args.tasks)?;
    let plan = args.plan.as_deref().map(read_text).transpose()?;
    let retry = RetryPolicy::from(&config.retry);

    let backend = CommandBackend::new(
        config.backend.command.clone(),
        config.backend.continue_args.clone(),
    );
    let tests = CommandTestRunner::new(config.tests.command.clone());
    let reviewer = BackendReviewer::new(&backend, retry);
    let decider: Box<dyn AttentionDecider> = match config.on_attention {
        AttentionMode::Prompt => Box::new(StdinDecider),
        AttentionMode::Continue => Box::new(FixedDecider(AttentionDecision::Continue)),
        AttentionMode::Stop => Box::new(FixedDecider(AttentionDecision::Stop)),
    };
    let planner = args.auto_replan.then(|| {
        BackendPlanner::new(
            &backend,
            workdir,
            config.review_timeout(),
            config.output_limit_bytes,
            retry,
        )
    });
    let events: Box<dyn EventSink> = if args.events_jsonl {
        Box::new(JsonLinesSink::new(std::io::stdout()))
    } else {
        Box::new(TracingSink)
    };

    let collab = Collaborators {
        backend: &backend,
        tests: &tests,
        reviewer: &reviewer,
        decider: decider.as_ref(),
        planner: planner.as_ref().map(|p| p as &dyn Planner),
        events: events.as_ref(),
    };
    let input = WorkflowInput {
        workdir: workdir.to_path_buf(),
        ticket: args.ticket.clone(),
        task_list,
        plan,
    };
    let summary = run_workflow(config, &collab, &input)?;
    if args.events_jsonl {
        println!("{}", serde_json::to_string(&summary).context("serialize run summary")?);
    } else {
        print_summary(&summary);
    }
    Ok(summary.exit_code())
}

fn print_summary(summary: &RunSummary) {
    println!("run {} (baseline {})", summary.run_id, short(&summary.baseline));
    for task in &summary.completed {
        let checkpoint = match (&task.checkpoint, task.no_changes) {
            (Some(sha), _) => short(sha).to_string(),
            (None, true) => "no changes".to_string(),
            (None, false) => "-".to_string(),
        };
        println!("  done     {} ({checkpoint})", task.name);
    }
    for task in &summary.failed {
        let state = if task.cancelled { "cancel" } else { "failed" };
        println!("  {state}   {} after {} attempt(s)", task.name, task.attempts);
    }
    for name in &summary.not_started {
        println!("  pending  {name}");
    }
    for task in &summary.rolled_back {
        println!("  undone   {} (restored by replan)", task.name);
    }
    match summary.final_verdict {
        Some(verdict) => println!("verdict: {verdict}"),
        None => println!("verdict: not reviewed"),
    }
    if summary.replan_triggered {
        println!("replan triggered ({} replan(s) applied)", summary.replans);
    }
    if let Some(reason) = &summary.stopped {
        match serde_json::to_string(reason) {
            Ok(text) => println!("stopped: {text}"),
            Err(_) => println!("stopped: {reason:?}"),
        }
    }
}

fn cmd_verdict(file: Option<&Path>) -> Result<i32> {
    let text = match file {
        Some(path) => read_text(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read review from stdin")?;
            buf
        }
    };
    let verdict = parse_verdict(&text);
    println!("{verdict}");
    Ok(match verdict {
        Verdict::Pass => exit_codes::OK,
        Verdict::NeedsAttention => exit_codes::ATTENTION,
        Verdict::NeedsReplan => exit_codes::REPLAN,
    })
}

fn cmd_restore(workdir: &Path, commit: &str) -> Result<i32> {
    let guard = BaselineGuard::new(workdir, DirtyTreePolicy::Warn, Default::default());
    let commit = guard.git().rev_parse(commit)?;
    guard.restore_to_baseline(&Baseline::at(commit.clone()))?;
    println!("restored to {}", short(&commit));
    Ok(exit_codes::OK)
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn join_files(files: &std::collections::BTreeSet<String>) -> String {
    files.iter().cloned().collect::<Vec<_>>().join(", ")
}

fn short(sha: &str) -> &str {
    sha.get(..10).unwrap_or(sha)
}
