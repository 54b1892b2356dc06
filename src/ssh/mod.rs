//! Remote execution abstraction
//!
//! Every orchestration step goes through the [`Executor`] trait: run a
//! command, run an ordered command sequence, ship a file or tree to a host,
//! pull one back, or check reachability. The production implementation is
//! [`SshExecutor`]; tests substitute a recording mock.
//!
//! Targets recognized as this machine bypass the network transport and run
//! as direct subprocesses, unless the process is unprivileged.

mod client;
mod local;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

pub use client::SshExecutor;

/// Errors surfaced by remote execution
#[derive(Error, Debug)]
pub enum ExecError {
    /// Transport or handshake failure, after bounded retries.
    #[error("Failed to connect to {host}: {message}")]
    Connectivity { host: String, message: String },

    /// Non-zero exit from a remote or local command. Never retried.
    #[error("Command failed on {host}: `{command}`: {output}")]
    Command {
        host: String,
        command: String,
        output: String,
    },

    /// A command expected to produce output produced none.
    #[error("Command produced no output on {host}: `{command}`")]
    EmptyResult { host: String, command: String },

    /// The transport-level protocol broke mid-session.
    #[error("SSH protocol error on {host}: {message}")]
    Protocol { host: String, message: String },

    #[error("Command timed out on {host}: `{command}`")]
    Timeout { host: String, command: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Uniform capability to drive one host.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Check that the host is reachable and authenticated.
    async fn ping(&self, host: &str) -> Result<(), ExecError>;

    /// Run one command and capture its combined output.
    async fn output(&self, host: &str, cmd: &str) -> Result<Vec<u8>, ExecError>;

    /// Run an ordered sequence of commands, streaming combined output to the
    /// log. Stops at the first non-zero exit; the error carries the full
    /// captured text, the command and the host.
    async fn run(&self, host: &str, cmds: &[String]) -> Result<(), ExecError>;

    /// Copy a file or directory tree to the host.
    async fn upload(&self, host: &str, src: &Path, dst: &str) -> Result<(), ExecError>;

    /// Fetch a single remote file to a local path.
    async fn download(&self, host: &str, src: &str, dst: &Path) -> Result<(), ExecError>;

    /// Run one command and return its output as a string with line
    /// terminators rewritten to `sep`. Empty output is an error: the remote
    /// utility produced no result.
    async fn output_to_string(
        &self,
        host: &str,
        cmd: &str,
        sep: &str,
    ) -> Result<String, ExecError> {
        let raw = self.output(host, cmd).await?;
        let text = String::from_utf8_lossy(&raw);
        let joined = text
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(sep);
        if joined.is_empty() {
            return Err(ExecError::EmptyResult {
                host: host.to_string(),
                command: cmd.to_string(),
            });
        }
        Ok(joined)
    }
}

/// Render per-host environment overrides as a command prefix.
pub fn prefix_env(env: &HashMap<String, String>, cmd: &str) -> String {
    if env.is_empty() {
        return cmd.to_string();
    }
    let mut pairs: Vec<_> = env.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    let exports = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, quote_value(v)))
        .collect::<Vec<_>>()
        .join(" ");
    format!("{} {}", exports, cmd)
}

/// Double-quote a value for the remote shell. Characters the shell still
/// interprets inside double quotes are backslash-escaped.
fn quote_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '$' | '`' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedOutput(&'static str);

    #[async_trait]
    impl Executor for FixedOutput {
        async fn ping(&self, _host: &str) -> Result<(), ExecError> {
            Ok(())
        }
        async fn output(&self, _host: &str, _cmd: &str) -> Result<Vec<u8>, ExecError> {
            Ok(self.0.as_bytes().to_vec())
        }
        async fn run(&self, _host: &str, _cmds: &[String]) -> Result<(), ExecError> {
            Ok(())
        }
        async fn upload(&self, _host: &str, _src: &Path, _dst: &str) -> Result<(), ExecError> {
            Ok(())
        }
        async fn download(&self, _host: &str, _src: &str, _dst: &Path) -> Result<(), ExecError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_output_to_string_joins_lines() {
        let exec = FixedOutput("a\nb\r\nc\n");
        let s = exec.output_to_string("h", "cmd", ",").await.unwrap();
        assert_eq!(s, "a,b,c");
    }

    #[tokio::test]
    async fn test_output_to_string_empty_is_error() {
        let exec = FixedOutput("\n\n");
        let err = exec.output_to_string("h", "cmd", ",").await.unwrap_err();
        assert!(matches!(err, ExecError::EmptyResult { .. }));
    }

    #[test]
    fn test_prefix_env_is_sorted_and_quoted() {
        let mut env = HashMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());
        assert_eq!(prefix_env(&env, "true"), "A=\"1\" B=\"2\" true");
        assert_eq!(prefix_env(&HashMap::new(), "true"), "true");
    }

    #[test]
    fn test_prefix_env_escapes_shell_metacharacters() {
        let mut env = HashMap::new();
        env.insert("MSG".to_string(), r#"say "$HOME" and `id`"#.to_string());
        assert_eq!(
            prefix_env(&env, "true"),
            r#"MSG="say \"\$HOME\" and \`id\`" true"#
        );
    }
}
