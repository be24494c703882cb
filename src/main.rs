//! ask-shell CLI entry point

use anyhow::{Context, Result};
use ask_shell::core::run_logs;
use ask_shell::{AskShell, AskShellSettings, PoolSummary, PromptMode, Prompter, RunState, ShellConfig};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "ask-shell", version, about = "Run, retry and pool shell commands")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one command and exit with its exit code
    Run(RunArgs),
    /// Run shell scripts concurrently
    Pool(PoolArgs),
    /// Ask a yes/no question: exit 0 for yes, 1 for no, 2 on error
    Confirm(ConfirmArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Extra attempts after a failure
    #[arg(long, default_value_t = 0)]
    retries: u32,

    /// Per-attempt timeout in seconds
    #[arg(long, value_parser = parse_secs)]
    timeout: Option<Duration>,

    /// Working directory
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Environment override, repeatable
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Treat a non-zero exit as success
    #[arg(long)]
    allow_non_zero_exit: bool,

    /// Run the command through `sh -c`
    #[arg(long)]
    shell: bool,

    /// Print run events as JSON lines
    #[arg(long)]
    json: bool,

    /// Root directory for run log files, the user cache directory when no path is given
    #[arg(long, num_args = 0..=1, value_name = "DIR")]
    log_dir: Option<Option<PathBuf>>,

    /// Command to run
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct PoolArgs {
    /// Maximum runs executing at the same time
    #[arg(short = 'j', long)]
    jobs: Option<usize>,

    /// Extra attempts after a failure, per script
    #[arg(long, default_value_t = 0)]
    retries: u32,

    /// Per-attempt timeout in seconds
    #[arg(long, value_parser = parse_secs)]
    timeout: Option<Duration>,

    /// Stop the remaining scripts at the first failure
    #[arg(long)]
    fail_fast: bool,

    /// Write a JSON summary of the runs to this file
    #[arg(long)]
    summary: Option<PathBuf>,

    /// Print run events as JSON lines
    #[arg(long)]
    json: bool,

    /// Root directory for run log files, the user cache directory when no path is given
    #[arg(long, num_args = 0..=1, value_name = "DIR")]
    log_dir: Option<Option<PathBuf>>,

    /// Shell scripts to run
    #[arg(required = true)]
    scripts: Vec<String>,
}

#[derive(Args, Debug)]
struct ConfirmArgs {
    /// Question to ask
    prompt: String,

    /// Answer used when nobody can be asked
    #[arg(long, value_enum)]
    default: Option<YesNo>,

    /// Never ask, answer from the default
    #[arg(long)]
    non_interactive: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum YesNo {
    Yes,
    No,
}

fn parse_secs(value: &str) -> Result<Duration, String> {
    let secs: f64 = value.parse().map_err(|_| format!("'{}' is not a number", value))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("timeout must be positive, got {}", value));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn parse_env_pair(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", value)),
    }
}

fn exit_code(code: Option<i32>) -> ExitCode {
    match code {
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = AskShellSettings::load().context("Failed to load settings")?;
    log::debug!("ask-shell v{} with {:?}", env!("CARGO_PKG_VERSION"), settings);

    match cli.command {
        Command::Run(args) => run(args, settings).await,
        Command::Pool(args) => pool(args, settings).await,
        Command::Confirm(args) => Ok(confirm(args, settings)),
    }
}

/// Offer to clean a full run logs directory before any run starts
fn ensure_run_logs_space(shell: &AskShell) -> Result<()> {
    let Some(root) = shell.settings().run_logs_dir.as_deref() else {
        return Ok(());
    };
    if !run_logs::is_full(root)? {
        return Ok(());
    }
    let prompt = format!("Run logs directory {} is full, clean it up?", root.display());
    if shell.prompter().confirm(&prompt, Some(false))? {
        let removed = run_logs::clean_run_logs(root)?;
        log::info!("Removed {} run log directories from {}", removed, root.display());
    } else {
        shell.console().warn("run logs directory is full, no log files will be written");
    }
    Ok(())
}

/// Apply a `--log-dir` flag, with or without a path
fn apply_log_dir(settings: &mut AskShellSettings, log_dir: Option<Option<PathBuf>>) -> Result<()> {
    match log_dir {
        None => {}
        Some(Some(dir)) => settings.run_logs_dir = Some(dir),
        Some(None) => {
            let dir = AskShellSettings::default_run_logs_dir()
                .context("No cache directory available for run logs")?;
            settings.run_logs_dir = Some(dir);
        }
    }
    Ok(())
}

async fn run(args: RunArgs, mut settings: AskShellSettings) -> Result<ExitCode> {
    apply_log_dir(&mut settings, args.log_dir)?;
    settings.event_log_json |= args.json;
    let shell = AskShell::new(settings);
    ensure_run_logs_space(&shell)?;

    let mut builder = if args.shell {
        ShellConfig::shell(args.command.join(" "))
    } else {
        ShellConfig::builder(args.command)
    };
    builder = builder
        .retries(args.retries)
        .allow_non_zero_exit(args.allow_non_zero_exit)
        .envs(args.env);
    if let Some(timeout) = args.timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(cwd) = args.cwd {
        builder = builder.cwd(cwd);
    }
    let config = builder.build().context("Invalid command")?;

    let handle = shell.run(config);
    tokio::select! {
        _ = handle.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            shell.shutdown("interrupted").await;
        }
    }

    Ok(match handle.state() {
        RunState::Succeeded | RunState::Failed => exit_code(handle.exit_code()),
        _ => ExitCode::FAILURE,
    })
}

async fn pool(args: PoolArgs, mut settings: AskShellSettings) -> Result<ExitCode> {
    if let Some(jobs) = args.jobs {
        settings.max_concurrent_runs = jobs.max(1);
    }
    apply_log_dir(&mut settings, args.log_dir)?;
    settings.event_log_json |= args.json;
    let shell = AskShell::new(settings);
    ensure_run_logs_space(&shell)?;

    for script in &args.scripts {
        let mut builder = ShellConfig::shell(script.as_str()).retries(args.retries);
        if let Some(timeout) = args.timeout {
            builder = builder.timeout(timeout);
        }
        shell.run(builder.build().with_context(|| format!("Invalid script '{}'", script))?);
    }

    let waiting = async {
        if args.fail_fast {
            if let Err(e) = shell.pool().wait_all_ok().await {
                log::warn!("Stopped after first failure: {}", e);
            }
        }
        shell.pool().wait_on_ok_errors(None, false).await
    };
    let outcome = tokio::select! {
        outcome = waiting => outcome,
        _ = tokio::signal::ctrl_c() => {
            shell.shutdown("interrupted").await;
            shell.pool().wait_on_ok_errors(None, true).await
        }
    };

    if !shell.console().is_json() {
        for run in &outcome.ok {
            shell.console().line(&format!("ok: {}", run.config().print_prefix()));
        }
        for (error, run) in &outcome.errors {
            let reason = match run.exit_code() {
                Some(code) => format!("exit code {}", code),
                None => error.to_string().lines().next().unwrap_or_default().to_string(),
            };
            shell
                .console()
                .warn(&format!("failed: {} ({})", run.config().print_prefix(), reason));
        }
    }

    if let Some(path) = &args.summary {
        PoolSummary::from_outcome(&outcome).save(path)?;
    }

    Ok(if outcome.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn confirm(args: ConfirmArgs, settings: AskShellSettings) -> ExitCode {
    let mut prompter = Prompter::from_settings(&settings);
    if args.non_interactive {
        prompter = prompter.with_mode(PromptMode::NonInteractive);
    }
    let default = args.default.map(|d| matches!(d, YesNo::Yes));

    match prompter.confirm(&args.prompt, default) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(2)
        }
    }
}
