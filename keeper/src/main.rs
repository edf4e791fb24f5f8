//! `keeper` CLI.
//!
//! One invocation is one logical run; scheduling is left to cron or CI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};

use keeper::core::types::RunOutcome;
use keeper::exit_codes;
use keeper::io::backlog::FileBacklog;
use keeper::io::config::{KeeperConfig, load_config};
use keeper::io::forge::GitHubForge;
use keeper::io::git::Git;
use keeper::io::init::{InitOptions, KeeperPaths, init_keeper};
use keeper::io::planner::CodexPlanner;
use keeper::io::verify::ShellVerifier;
use keeper::orchestrator::{Collaborators, ModeRequest, RunOptions, RunResult, check_truth, run_once};
use keeper::select::{SelectOutcome, select_from_root};
use keeper::summary::{build_summary, publish_summary};
use keeper::validate::validate_keeper;

#[derive(Parser)]
#[command(
    name = "keeper",
    version,
    about = "Autonomous repository maintenance: fix failing checks or advance a milestone, one PR per run"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.keeper/` with a default config and an empty backlog.
    Init {
        /// Rewrite config, schema and `.gitignore` (the backlog is kept).
        #[arg(short, long)]
        force: bool,
    },
    /// Check layout, config and backlog invariants.
    Validate,
    /// Print the milestone the next milestone-mode run would claim.
    Select,
    /// Run the truth checks on the current checkout and record the result.
    Check,
    /// Perform one run.
    Run {
        #[arg(long, value_enum, default_value_t = ModeArg::Auto)]
        mode: ModeArg,
        /// Lift the file and line limits of the safety policy.
        #[arg(long)]
        escalate: bool,
        /// Run even if a milestone halted further runs today.
        #[arg(long)]
        ignore_halt: bool,
    },
    /// Recompute the daily summary from the run log.
    Summary {
        /// Day to summarize (YYYY-MM-DD, UTC). Defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Upsert the summary issue on the forge.
        #[arg(long)]
        publish: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Auto,
    Fix,
    Milestone,
}

impl From<ModeArg> for ModeRequest {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Auto => ModeRequest::Auto,
            ModeArg::Fix => ModeRequest::Fix,
            ModeArg::Milestone => ModeRequest::Milestone,
        }
    }
}

fn main() {
    keeper::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Validate => cmd_validate(&root),
        Command::Select => cmd_select(&root),
        Command::Check => cmd_check(&root),
        Command::Run {
            mode,
            escalate,
            ignore_halt,
        } => cmd_run(&root, mode.into(), escalate, ignore_halt),
        Command::Summary { date, publish } => cmd_summary(&root, date, publish),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_keeper(root, &InitOptions { force })?;
    println!("initialized {}", paths.keeper_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(root: &Path) -> Result<i32> {
    let outcome = validate_keeper(root)?;
    println!(
        "ok: {} milestones, {} truth checks",
        outcome.milestones, outcome.truth_checks
    );
    Ok(exit_codes::OK)
}

fn cmd_select(root: &Path) -> Result<i32> {
    match select_from_root(root)? {
        SelectOutcome::Next(milestone) => {
            println!("{}", milestone.id);
            Ok(exit_codes::OK)
        }
        SelectOutcome::Busy(milestone) => {
            eprintln!("milestone '{}' is in_progress", milestone.id);
            Ok(exit_codes::BUSY)
        }
        SelectOutcome::Empty => {
            eprintln!("no todo milestone");
            Ok(exit_codes::EMPTY)
        }
    }
}

fn cmd_check(root: &Path) -> Result<i32> {
    let cfg = load_keeper_config(root)?;
    let result = check_truth(root, &cfg, &shell_verifier(&cfg))?;
    print!("{}", result.render_markdown());
    Ok(if result.all_passed {
        exit_codes::OK
    } else {
        exit_codes::RED
    })
}

fn cmd_run(root: &Path, mode: ModeRequest, escalate: bool, ignore_halt: bool) -> Result<i32> {
    validate_keeper(root)?;
    let cfg = load_keeper_config(root)?;
    let paths = KeeperPaths::new(root);

    let forge = GitHubForge::from_config(&cfg, Git::new(root, cfg.git_timeout()))?;
    let planner = codex_planner(root, &cfg, &paths);
    let verifier = shell_verifier(&cfg);
    let backlog = FileBacklog::new(&paths.backlog_path, &paths.backlog_lock_path);
    let deps = Collaborators {
        planner: &planner,
        forge: &forge,
        verifier: &verifier,
        backlog: &backlog,
    };
    let options = RunOptions {
        mode,
        escalate,
        ignore_halt,
        date: Utc::now().date_naive(),
    };

    match run_once(root, &cfg, &deps, &options)? {
        RunResult::Halted { date } => {
            println!("halted: no further runs on {date}");
            Ok(exit_codes::OK)
        }
        RunResult::Finished(record) => {
            let detail = record
                .pr_url
                .as_deref()
                .or(record.reason.as_deref())
                .unwrap_or("");
            println!("{} {}: {detail}", record.run_id, record.outcome);
            Ok(match record.outcome {
                RunOutcome::PrCreated | RunOutcome::NoOp => exit_codes::OK,
                RunOutcome::Blocked => exit_codes::BLOCKED,
                RunOutcome::Error => exit_codes::INVALID,
            })
        }
    }
}

fn cmd_summary(root: &Path, date: Option<NaiveDate>, publish: bool) -> Result<i32> {
    let date = date.unwrap_or_else(|| Utc::now().date_naive());
    let rendered = build_summary(root, date)?;
    print!("{}", rendered.markdown);
    if publish {
        let cfg = load_keeper_config(root)?;
        let forge = GitHubForge::from_config(&cfg, Git::new(root, cfg.git_timeout()))?;
        let url = publish_summary(&forge, &rendered)?;
        eprintln!("published {url}");
    }
    Ok(exit_codes::OK)
}

fn load_keeper_config(root: &Path) -> Result<KeeperConfig> {
    load_config(&KeeperPaths::new(root).config_path)
}

fn shell_verifier(cfg: &KeeperConfig) -> ShellVerifier {
    ShellVerifier::new(
        Duration::from_secs(cfg.verify.timeout_secs),
        cfg.verify.output_limit_bytes,
    )
}

fn codex_planner(root: &Path, cfg: &KeeperConfig, paths: &KeeperPaths) -> CodexPlanner {
    CodexPlanner {
        command: cfg.planner.command.clone(),
        model: cfg.planner.model.clone(),
        workdir: PathBuf::from(root),
        schema_path: paths.plan_schema_path.clone(),
        output_path: paths.planner_output_path.clone(),
        log_path: paths.planner_log_path.clone(),
        timeout: Duration::from_secs(cfg.planner.timeout_secs),
        output_limit_bytes: cfg.planner.output_limit_bytes,
    }
}
