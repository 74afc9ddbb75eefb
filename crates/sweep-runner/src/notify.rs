use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};
use tracing::info;

use crate::config::ExperimentSettings;

/// Receives grid-level notices (completion, fatal failure).
pub trait Notifier {
    fn notify(&self, subject: &str, body: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, body: &str) -> Result<()> {
        info!(subject, "{}", body);
        Ok(())
    }
}

/// Pipes the body to a shell command; the subject is passed as
/// `SWEEP_SUBJECT`. Typically wraps a local mail or chat client.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    pub command: String,
}

impl Notifier for CommandNotifier {
    fn notify(&self, subject: &str, body: &str) -> Result<()> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("SWEEP_SUBJECT", subject)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning notify command `{}`", self.command))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(body.as_bytes())?;
        }
        let status = child.wait()?;
        if !status.success() {
            return Err(anyhow!(
                "notify command `{}` exited with {}",
                self.command,
                status
            ));
        }
        Ok(())
    }
}

/// `CommandNotifier` when mail is enabled and a command is configured,
/// otherwise notices only go to the log.
pub fn notifier_for(settings: &ExperimentSettings) -> Box<dyn Notifier> {
    match (&settings.notify_command, settings.send_mail) {
        (Some(command), true) if !command.trim().is_empty() => Box::new(CommandNotifier {
            command: command.clone(),
        }),
        _ => Box::new(LogNotifier),
    }
}
