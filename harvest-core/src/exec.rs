//! Command execution capability.
//!
//! Every stage that touches a host goes through [`RemoteExecutor`]. The
//! management host runs commands through [`LocalShell`]; every other node
//! type gets an SSH session from the server crate. The choice is made once
//! per host.

use crate::error::{HarvestError, Result};
use std::io::{Read, Write};
use std::process::{Command, Stdio};

/// Exit status and diagnostics of a command whose stdout was streamed.
#[derive(Debug, Clone, Default)]
pub struct ExecStatus {
    pub exit_code: i32,
    pub stderr: String,
}

impl ExecStatus {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Fully captured command output.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ExecOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run a command line on one host and read stdout/stderr/exit code.
pub trait RemoteExecutor: Send {
    /// Host name this executor is bound to.
    fn host(&self) -> &str;

    /// True when commands run on the harvesting machine itself.
    fn is_local(&self) -> bool;

    /// Run `command` and stream its stdout into `sink`.
    fn run_streaming(&mut self, command: &str, sink: &mut dyn Write) -> Result<ExecStatus>;

    /// Run `command` and capture its stdout.
    fn run(&mut self, command: &str) -> Result<ExecOutput> {
        let mut stdout = Vec::new();
        let status = self.run_streaming(command, &mut stdout)?;
        Ok(ExecOutput {
            exit_code: status.exit_code,
            stdout,
            stderr: status.stderr,
        })
    }
}

/// Executes command lines with `/bin/sh -c` on the local machine.
#[derive(Debug, Clone)]
pub struct LocalShell {
    host: String,
    sudo: bool,
}

impl LocalShell {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            sudo: false,
        }
    }

    /// Prefix every command with `sudo`.
    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    fn command_line(&self, command: &str) -> String {
        if self.sudo {
            format!("/usr/bin/sudo /bin/sh -c {}", shell_words::quote(command))
        } else {
            command.to_string()
        }
    }
}

impl RemoteExecutor for LocalShell {
    fn host(&self) -> &str {
        &self.host
    }

    fn is_local(&self) -> bool {
        true
    }

    fn run_streaming(&mut self, command: &str, sink: &mut dyn Write) -> Result<ExecStatus> {
        let line = self.command_line(command);
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| HarvestError::connectivity(&self.host, e))?;

        // Drain stderr concurrently so a chatty command cannot block on a full pipe
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        let copy_result = match child.stdout.take() {
            Some(mut stdout) => std::io::copy(&mut stdout, sink).map(|_| ()),
            None => Ok(()),
        };

        let status = child
            .wait()
            .map_err(|e| HarvestError::connectivity(&self.host, e))?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        copy_result.map_err(|e| HarvestError::transfer(&self.host, e))?;

        Ok(ExecStatus {
            exit_code: status.code().unwrap_or(-1),
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_local_shell_captures_output() {
        let mut shell = LocalShell::new("localhost");
        let output = shell.run("echo hello; echo oops >&2; exit 3").unwrap();
        assert_eq!(output.stdout_lossy(), "hello\n");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
    }

    #[test]
    fn test_sudo_wraps_command() {
        let shell = LocalShell::new("localhost").with_sudo(true);
        assert_eq!(
            shell.command_line("ls -l /var/log"),
            "/usr/bin/sudo /bin/sh -c 'ls -l /var/log'"
        );
    }
}
