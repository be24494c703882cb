//! Shell configuration - immutable description of what a run executes

use super::events::Stream;
use super::retry::BackoffPolicy;
use super::run::ShellRun;
use crate::error::ShellError;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::Arc;
use std::time::Duration;

/// Called with every output line of a run
pub type OutputCallback = Arc<dyn Fn(&str, Stream) + Send + Sync>;

/// Decides whether a failed attempt may be retried
pub type RetryPredicate = Arc<dyn Fn(&ShellRun) -> bool + Send + Sync>;

/// Binaries whose output is expected to carry ANSI colors
const ANSI_BINARIES: &[&str] = &["terraform", "kubectl"];

/// What to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Program and arguments, executed directly
    Argv(Vec<String>),
    /// Script executed through `sh -c`
    Shell(String),
}

impl CommandLine {
    /// Executable token and the remaining arguments
    fn split(&self) -> (String, Vec<String>) {
        let parts: Vec<String> = match self {
            Self::Argv(argv) => argv.clone(),
            Self::Shell(script) => script.split_whitespace().map(str::to_string).collect(),
        };
        let mut parts = parts.into_iter();
        let program = parts.next().unwrap_or_default();
        (program, parts.collect())
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Argv(argv) => write!(f, "{}", argv.join(" ")),
            Self::Shell(script) => write!(f, "{}", script),
        }
    }
}

/// First positional argument, skipping flags and the values of flags
pub fn first_arg(args: &[String]) -> &str {
    for (i, arg) in args.iter().enumerate() {
        if arg.starts_with('-') {
            continue;
        }
        if i == 0 {
            return arg;
        }
        let prev = &args[i - 1];
        let prev_is_flag = prev.starts_with('-') && !prev.contains('=');
        if !prev_is_flag {
            return arg;
        }
    }
    ""
}

/// Immutable run configuration, created through [`ShellConfig::builder`]
#[derive(Clone)]
pub struct ShellConfig {
    command: CommandLine,
    program: PathBuf,
    exec_name: String,
    cwd: PathBuf,
    env: BTreeMap<String, String>,
    skip_os_env: bool,
    timeout: Option<Duration>,
    retries: u32,
    backoff: BackoffPolicy,
    should_retry: Option<RetryPredicate>,
    allow_non_zero_exit: bool,
    output_callback: Option<OutputCallback>,
    print_prefix: String,
    ansi_content: bool,
    include_log_time: bool,
    run_output_dir: Option<PathBuf>,
}

impl fmt::Debug for ShellConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellConfig")
            .field("command", &self.command.to_string())
            .field("cwd", &self.cwd)
            .field("attempts", &self.attempts())
            .finish()
    }
}

impl ShellConfig {
    /// Builder for a program and its arguments
    pub fn builder<I, S>(argv: I) -> ShellConfigBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ShellConfigBuilder::new(CommandLine::Argv(argv.into_iter().map(Into::into).collect()))
    }

    /// Builder for a script run through `sh -c`
    pub fn shell(script: impl Into<String>) -> ShellConfigBuilder {
        ShellConfigBuilder::new(CommandLine::Shell(script.into()))
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    /// Resolved executable for argv commands, `sh` for scripts
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments passed to [`ShellConfig::program`]
    pub fn program_args(&self) -> Vec<String> {
        match &self.command {
            CommandLine::Argv(argv) => argv.iter().skip(1).cloned().collect(),
            CommandLine::Shell(script) => vec!["-c".to_string(), script.clone()],
        }
    }

    /// File name of the executable, used for log directory names
    pub fn exec_name(&self) -> &str {
        &self.exec_name
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn skip_os_env(&self) -> bool {
        self.skip_os_env
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Total launches allowed: one plus the retries
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub fn should_retry(&self, run: &ShellRun) -> bool {
        self.should_retry.as_ref().map_or(true, |predicate| predicate(run))
    }

    pub fn allow_non_zero_exit(&self) -> bool {
        self.allow_non_zero_exit
    }

    pub fn output_callback(&self) -> Option<&OutputCallback> {
        self.output_callback.as_ref()
    }

    pub fn print_prefix(&self) -> &str {
        &self.print_prefix
    }

    pub fn ansi_content(&self) -> bool {
        self.ansi_content
    }

    pub fn include_log_time(&self) -> bool {
        self.include_log_time
    }

    pub fn run_output_dir(&self) -> Option<&Path> {
        self.run_output_dir.as_deref()
    }

    /// Log file stem for an attempt: `<exec>` then `<exec>_<attempt>`
    pub fn run_log_stem(&self, attempt: u32) -> String {
        if attempt > 1 {
            format!("{}_{}", self.exec_name, attempt)
        } else {
            self.exec_name.clone()
        }
    }
}

/// Builder for [`ShellConfig`]
pub struct ShellConfigBuilder {
    command: CommandLine,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    skip_os_env: bool,
    skip_binary_check: bool,
    timeout: Option<Duration>,
    retries: u32,
    backoff: BackoffPolicy,
    should_retry: Option<RetryPredicate>,
    allow_non_zero_exit: bool,
    output_callback: Option<OutputCallback>,
    print_prefix: Option<String>,
    ansi_content: Option<bool>,
    include_log_time: bool,
    run_output_dir: Option<PathBuf>,
}

impl ShellConfigBuilder {
    fn new(command: CommandLine) -> Self {
        Self {
            command,
            cwd: None,
            env: BTreeMap::new(),
            skip_os_env: false,
            skip_binary_check: false,
            timeout: None,
            retries: 0,
            backoff: BackoffPolicy::none(),
            should_retry: None,
            allow_non_zero_exit: false,
            output_callback: None,
            print_prefix: None,
            ansi_content: None,
            include_log_time: false,
            run_output_dir: None,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env.extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Start from an empty environment instead of the current process one
    pub fn skip_os_env(mut self, skip: bool) -> Self {
        self.skip_os_env = skip;
        self
    }

    pub fn skip_binary_check(mut self, skip: bool) -> Self {
        self.skip_binary_check = skip;
        self
    }

    /// Per-attempt timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ShellRun) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn allow_non_zero_exit(mut self, allow: bool) -> Self {
        self.allow_non_zero_exit = allow;
        self
    }

    pub fn on_output<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Stream) + Send + Sync + 'static,
    {
        self.output_callback = Some(Arc::new(callback));
        self
    }

    pub fn print_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.print_prefix = Some(prefix.into());
        self
    }

    pub fn ansi_content(mut self, ansi: bool) -> Self {
        self.ansi_content = Some(ansi);
        self
    }

    pub fn include_log_time(mut self, include: bool) -> Self {
        self.include_log_time = include;
        self
    }

    pub fn run_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_output_dir = Some(dir.into());
        self
    }

    /// Validate and resolve the configuration
    pub fn build(self) -> Result<ShellConfig, ShellError> {
        let (token, args) = self.command.split();
        if token.is_empty() {
            return Err(ShellError::InvalidConfig("command must not be empty".to_string()));
        }

        let cwd = match self.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir()
                .map_err(|e| ShellError::InvalidConfig(format!("no current dir: {}", e)))?,
        };
        let cwd = cwd
            .canonicalize()
            .map_err(|_| ShellError::InvalidConfig(format!("cwd {} does not exist", cwd.display())))?;
        if !cwd.is_dir() {
            return Err(ShellError::InvalidConfig(format!(
                "cwd {} is not a directory",
                cwd.display()
            )));
        }

        let is_file_call = token.contains(MAIN_SEPARATOR) || token.contains('/');
        let exec_name = Path::new(&token)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| token.clone());

        let path_var = self
            .env
            .get("PATH")
            .cloned()
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_default();
        let program = match &self.command {
            CommandLine::Shell(_) => {
                resolve_binary("sh", &path_var).unwrap_or_else(|| PathBuf::from("/bin/sh"))
            }
            CommandLine::Argv(_) if is_file_call || self.skip_binary_check => PathBuf::from(&token),
            CommandLine::Argv(_) => resolve_binary(&token, &path_var)
                .ok_or_else(|| ShellError::BinaryNotFound { binary: token.clone() })?,
        };

        let print_prefix = self.print_prefix.unwrap_or_else(|| {
            infer_print_prefix(&cwd, &token, is_file_call, &args)
        });
        let ansi_content = self
            .ansi_content
            .unwrap_or_else(|| !is_file_call && ANSI_BINARIES.contains(&token.as_str()));

        Ok(ShellConfig {
            command: self.command,
            program,
            exec_name,
            cwd,
            env: self.env,
            skip_os_env: self.skip_os_env,
            timeout: self.timeout,
            retries: self.retries,
            backoff: self.backoff,
            should_retry: self.should_retry,
            allow_non_zero_exit: self.allow_non_zero_exit,
            output_callback: self.output_callback,
            print_prefix,
            ansi_content,
            include_log_time: self.include_log_time,
            run_output_dir: self.run_output_dir,
        })
    }
}

/// `<cwd parent>/<cwd name> <binary or relative file> <first arg>`
fn infer_print_prefix(cwd: &Path, token: &str, is_file_call: bool, args: &[String]) -> String {
    let dir_name = |path: &Path| {
        path.file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    };

    let mut parts = Vec::new();
    let cwd_name = dir_name(cwd);
    match cwd.parent().map(dir_name) {
        Some(parent) if !parent.is_empty() => parts.push(format!("{}/{}", parent, cwd_name)),
        _ if !cwd_name.is_empty() => parts.push(cwd_name),
        _ => {}
    }

    if is_file_call {
        let file = Path::new(token);
        let relative = file.strip_prefix(cwd).unwrap_or(file);
        parts.push(relative.display().to_string());
    } else {
        parts.push(token.to_string());
    }

    let arg = first_arg(args);
    if !arg.is_empty() {
        parts.push(arg.to_string());
    }
    parts.join(" ")
}

/// Find `binary` in the directories of a `PATH` value
pub fn resolve_binary(binary: &str, path_var: &str) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_first_arg() {
        assert_eq!(first_arg(&args(&["some_arg", "--option1"])), "some_arg");
        assert_eq!(first_arg(&args(&["--flag", "value", "apply"])), "apply");
        assert_eq!(first_arg(&args(&["--flag=value", "plan"])), "plan");
        assert_eq!(first_arg(&args(&["-v"])), "");
        assert_eq!(first_arg(&[]), "");
    }

    #[test]
    fn test_print_prefix_inferred_from_cwd_and_args() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("path").join("prefix");
        std::fs::create_dir_all(&nested).unwrap();

        let config = ShellConfig::shell("some_script some_arg --option1")
            .cwd(&nested)
            .build()
            .unwrap();
        assert_eq!(config.print_prefix(), "path/prefix some_script some_arg");

        let config = ShellConfig::shell("some_script some_arg")
            .cwd(&nested)
            .print_prefix("override")
            .build()
            .unwrap();
        assert_eq!(config.print_prefix(), "override");
    }

    #[test]
    fn test_missing_binary_is_rejected() {
        let err = ShellConfig::builder(["definitely-not-a-binary-4711"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ShellError::BinaryNotFound { .. }));

        let config = ShellConfig::builder(["definitely-not-a-binary-4711"])
            .skip_binary_check(true)
            .build()
            .unwrap();
        assert_eq!(config.program(), Path::new("definitely-not-a-binary-4711"));
    }

    #[test]
    fn test_binary_is_resolved_on_path() {
        let config = ShellConfig::builder(["sh", "-c", "true"]).build().unwrap();
        assert!(config.program().is_absolute());
        assert_eq!(config.exec_name(), "sh");
        assert_eq!(config.program_args(), args(&["-c", "true"]));
    }

    #[test]
    fn test_invalid_configs() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            ShellConfig::builder(empty).build(),
            Err(ShellError::InvalidConfig(_))
        ));
        assert!(matches!(
            ShellConfig::shell("echo hi").cwd("/does/not/exist/4711").build(),
            Err(ShellError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_attempts_and_log_stems() {
        let config = ShellConfig::shell("terraform plan").retries(2).build().unwrap();
        assert_eq!(config.attempts(), 3);
        assert!(config.ansi_content());
        assert_eq!(config.run_log_stem(1), "terraform");
        assert_eq!(config.run_log_stem(3), "terraform_3");
        assert!(config.program().ends_with("sh"));
    }

    #[test]
    fn test_resolve_binary_uses_path_value() {
        assert!(resolve_binary("sh", "/nonexistent-dir-4711").is_none());
        let found = resolve_binary("sh", &std::env::var("PATH").unwrap()).unwrap();
        assert!(found.ends_with("sh"));
    }
}
