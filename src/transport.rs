//! Handing rendered messages to a sendmail-style command.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// What a mail command produced once it finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` if the command was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Something that can deliver a rendered message.
///
/// An `Err` means delivery couldn't be attempted at all. A command that ran
/// but failed is reported through [`CommandOutput::success`], so its output
/// can still be logged.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Short name used to label the transport's output in logs.
    fn name(&self) -> &str;

    async fn send(&self, message: &[u8]) -> Result<CommandOutput>;
}

/// Runs `<program> <recipient>` in `work_dir`, with the message on stdin.
#[derive(Debug, Clone)]
pub struct Sendmail {
    pub program: String,
    pub recipient: String,
    pub work_dir: PathBuf,
}

impl Sendmail {
    pub fn new(program: &str, recipient: &str, work_dir: impl Into<PathBuf>) -> Sendmail {
        Sendmail {
            program: program.to_string(),
            recipient: recipient.to_string(),
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl MailTransport for Sendmail {
    fn name(&self) -> &str {
        &self.program
    }

    async fn send(&self, message: &[u8]) -> Result<CommandOutput> {
        let mut child = Command::new(&self.program)
            .arg(&self.recipient)
            .current_dir(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to run '{}' in {}",
                    self.program,
                    self.work_dir.display()
                )
            })?;

        let mut stdin = child
            .stdin
            .take()
            .context("Child process has no stdin handle")?;

        // feed stdin while collecting output, so neither side can fill a pipe and stall
        let write_stdin = async move {
            let res = stdin.write_all(message).await;
            // closing stdin signals end of message
            drop(stdin);
            res
        };

        let (write_res, output) = tokio::join!(write_stdin, child.wait_with_output());

        let output = output.with_context(|| format!("Failed waiting for '{}'", self.program))?;
        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        // a command that bails out early won't read its stdin; its exit status says more
        if result.success() {
            write_res.with_context(|| format!("Failed writing message to '{}'", self.program))?;
        } else if let Err(e) = write_res {
            log::debug!("Error writing to '{}' stdin: {}", self.program, e);
        }

        Ok(result)
    }
}
