//! Shell invocation (spec §6 "Shell choices", §4.6 `run`). Grounded on the
//! teacher's `scriptlet::ScriptletExecutor`: stage the script to a temp
//! file with restrictive permissions, spawn with captured/streamed
//! stdout+stderr, wait with a timeout, translate a non-zero exit into
//! `Error::ShellFailure` when the caller asked for `check`.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::error::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// A shell choice: the built-in cross-platform options, or a custom
/// invocation descriptor (spec §6).
#[derive(Debug, Clone)]
pub enum Shell {
    Bash,
    Sh,
    Cmd,
    PowerShell,
    /// `{file = argv, ext = ".xyz"}`: write the script to a temp file with
    /// the given extension, invoke `argv + [tempfile]`.
    CustomFile { argv: Vec<String>, ext: String },
    /// `{inline = argv}`: invoke `argv + [script]` with the script text as
    /// a literal trailing argument.
    CustomInline { argv: Vec<String> },
}

impl Shell {
    fn is_windows_only(&self) -> bool {
        matches!(self, Shell::Cmd | Shell::PowerShell)
    }

    fn is_posix_only(&self) -> bool {
        matches!(self, Shell::Bash | Shell::Sh)
    }

    fn check_platform_applicable(&self) -> Result<()> {
        let windows_host = cfg!(target_os = "windows");
        if self.is_windows_only() && !windows_host {
            return Err(Error::ShellFailure {
                command: format!("{self:?}"),
                exit_code: None,
                signal: None,
                stdout: None,
                stderr: Some("this shell choice is only applicable on Windows".into()),
            });
        }
        if self.is_posix_only() && windows_host {
            return Err(Error::ShellFailure {
                command: format!("{self:?}"),
                exit_code: None,
                signal: None,
                stdout: None,
                stderr: Some("this shell choice is only applicable on POSIX hosts".into()),
            });
        }
        Ok(())
    }
}

impl Default for Shell {
    fn default() -> Self {
        if cfg!(target_os = "windows") {
            Shell::Cmd
        } else {
            Shell::Bash
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub shell: Option<Shell>,
    pub capture: bool,
    pub check: bool,
    pub quiet: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Execute `script` (joined by newline if given as multiple lines) under
/// the chosen shell, in `default_cwd` unless `opts.cwd` overrides it.
pub fn run(script: &str, default_cwd: &Path, opts: &RunOptions) -> Result<RunOutcome> {
    let shell = opts.shell.clone().unwrap_or_default();
    shell.check_platform_applicable()?;
    let cwd = opts.cwd.clone().unwrap_or_else(|| default_cwd.to_path_buf());

    let (program, mut args, _temp_guard): (String, Vec<String>, Option<tempfile::TempPath>) =
        match &shell {
            Shell::Bash => ("bash".into(), vec!["-c".into(), script.to_string()], None),
            Shell::Sh => ("sh".into(), vec!["-c".into(), script.to_string()], None),
            Shell::Cmd => ("cmd".into(), vec!["/C".into(), script.to_string()], None),
            Shell::PowerShell => (
                "powershell".into(),
                vec!["-Command".into(), script.to_string()],
                None,
            ),
            Shell::CustomFile { argv, ext } => {
                let mut file = tempfile::Builder::new()
                    .suffix(ext)
                    .tempfile()
                    .map_err(Error::Io)?;
                file.write_all(script.as_bytes()).map_err(Error::Io)?;
                let path = file.into_temp_path();
                let mut full_argv = argv.clone();
                full_argv.push(path.to_string_lossy().into_owned());
                let program = full_argv.remove(0);
                (program, full_argv, Some(path))
            }
            Shell::CustomInline { argv } => {
                let mut full_argv = argv.clone();
                full_argv.push(script.to_string());
                let program = full_argv.remove(0);
                (program, full_argv, None)
            }
        };
    args = args;

    debug!(program = %program, cwd = %cwd.display(), "running shell script");

    let mut command = Command::new(&program);
    command
        .args(&args)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .env_clear()
        .envs(std::env::vars())
        .envs(&opts.env);

    if opts.capture {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    }

    let mut child = command.spawn().map_err(Error::Io)?;

    let status = child
        .wait_timeout(DEFAULT_TIMEOUT)
        .map_err(Error::Io)?
        .ok_or_else(|| {
            let _ = child.kill();
            Error::ShellFailure {
                command: script.to_string(),
                exit_code: None,
                signal: None,
                stdout: None,
                stderr: Some("shell invocation timed out".into()),
            }
        })?;

    let stdout = if opts.capture {
        let mut buf = String::new();
        if let Some(mut out) = child.stdout.take() {
            use std::io::Read;
            let _ = out.read_to_string(&mut buf);
        }
        Some(buf)
    } else {
        None
    };
    let stderr = if opts.capture {
        let mut buf = String::new();
        if let Some(mut err) = child.stderr.take() {
            use std::io::Read;
            let _ = err.read_to_string(&mut buf);
        }
        Some(buf)
    } else {
        None
    };

    if let Some(stderr) = &stderr {
        if !opts.quiet {
            for line in stderr.lines() {
                warn!("{line}");
            }
        }
    }

    let exit_code = status.code();
    if opts.check && exit_code != Some(0) {
        return Err(Error::ShellFailure {
            command: script.to_string(),
            exit_code,
            #[cfg(unix)]
            signal: std::os::unix::process::ExitStatusExt::signal(&status),
            #[cfg(not(unix))]
            signal: None,
            stdout,
            stderr,
        });
    }

    Ok(RunOutcome {
        exit_code,
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_successful_script() {
        let dir = tempfile::TempDir::new().unwrap();
        let outcome = run(
            "exit 0",
            dir.path(),
            &RunOptions {
                check: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[test]
    fn check_raises_on_nonzero_exit() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = run(
            "exit 7",
            dir.path(),
            &RunOptions {
                check: true,
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn captures_stdout() {
        let dir = tempfile::TempDir::new().unwrap();
        let outcome = run(
            "echo hello",
            dir.path(),
            &RunOptions {
                capture: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(outcome.stdout.unwrap().trim(), "hello");
    }

    #[test]
    fn rejects_windows_only_shell_on_posix() {
        if cfg!(target_os = "windows") {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let result = run(
            "echo hi",
            dir.path(),
            &RunOptions {
                shell: Some(Shell::Cmd),
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }
}
