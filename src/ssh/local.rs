//! Local bypass - direct subprocess execution and recursive file copy
//!
//! Used when the target address resolves to this machine, so single-node
//! and self-targeting operations skip the SSH transport entirely.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use super::ExecError;

/// Run one command through the local shell, capturing combined output.
pub async fn output(host: &str, cmd: &str) -> Result<Vec<u8>, ExecError> {
    debug!("local exec on {}: {}", host, cmd);
    let out = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .output()
        .await?;
    let mut combined = out.stdout;
    combined.extend_from_slice(&out.stderr);
    if !out.status.success() {
        return Err(ExecError::Command {
            host: host.to_string(),
            command: cmd.to_string(),
            output: String::from_utf8_lossy(&combined).into_owned(),
        });
    }
    Ok(combined)
}

/// Run an ordered command sequence locally, stopping at the first failure.
pub async fn run(host: &str, cmds: &[String]) -> Result<(), ExecError> {
    for cmd in cmds {
        output(host, cmd).await?;
    }
    Ok(())
}

/// Recursive copy of a file or directory tree.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<(), ExecError> {
    if src.is_dir() {
        std::fs::create_dir_all(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dst)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_output_captures_stdout() {
        let out = output("127.0.0.1", "printf hello").await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_command_error() {
        let err = output("127.0.0.1", "printf oops >&2; exit 3")
            .await
            .unwrap_err();
        match err {
            ExecError::Command { host, output, .. } => {
                assert_eq!(host, "127.0.0.1");
                assert!(output.contains("oops"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_stops_at_first_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("marker");
        let cmds = vec![
            "false".to_string(),
            format!("touch {}", marker.display()),
        ];
        assert!(run("localhost", &cmds).await.is_err());
        assert!(!marker.exists());
    }

    #[test]
    fn test_copy_tree_recurses() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("a"), "1").unwrap();
        std::fs::write(src.join("sub/b"), "2").unwrap();

        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        assert_eq!(std::fs::read_to_string(dst.join("a")).unwrap(), "1");
        assert_eq!(std::fs::read_to_string(dst.join("sub/b")).unwrap(), "2");
    }
}
