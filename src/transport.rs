//! Messaging transports.
//!
//! The actual carrier (SMS gateway, WhatsApp bridge, ...) lives outside this
//! program. `CommandTransport` hands each message to an external executable
//! and classifies its exit status; `ConsoleTransport` is the fallback when no
//! carrier is configured.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::models::{Channel, DeliveryOutcome};

/// `EX_TEMPFAIL` from sysexits.h: the carrier asks us to try again later.
pub const EXIT_TEMPFAIL: i32 = 75;

#[derive(Debug, Clone, PartialEq)]
pub struct SendResult {
    pub outcome: DeliveryOutcome,
    pub detail: Option<String>,
}

impl SendResult {
    pub fn success() -> Self {
        Self {
            outcome: DeliveryOutcome::Success,
            detail: None,
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            outcome: DeliveryOutcome::TransientFailure,
            detail: Some(detail.into()),
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            outcome: DeliveryOutcome::PermanentFailure,
            detail: Some(detail.into()),
        }
    }
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(
        &self,
        channel: Channel,
        recipient: &str,
        body: &str,
        attachment: Option<&str>,
    ) -> SendResult;
}

/// Runs `<program> [args..] <channel> <recipient>` with the body on stdin.
pub struct CommandTransport {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandTransport {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

fn last_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
}

#[async_trait]
impl MessageTransport for CommandTransport {
    async fn send(
        &self,
        channel: Channel,
        recipient: &str,
        body: &str,
        attachment: Option<&str>,
    ) -> SendResult {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(channel.as_str())
            .arg(recipient)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match attachment {
            Some(path) => command.env("ALERT_ATTACHMENT", path),
            None => command.env_remove("ALERT_ATTACHMENT"),
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                return SendResult::permanent(format!(
                    "cannot run {}: {err}",
                    self.program.display()
                ));
            }
            Err(err) => return SendResult::transient(format!("spawn failed: {err}")),
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(body.as_bytes()).await {
                debug!(%channel, "transport closed stdin early: {err}");
            }
        }

        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(err) => return SendResult::transient(format!("transport wait failed: {err}")),
        };

        let detail = last_line(&output.stderr);
        match output.status.code() {
            Some(0) => SendResult {
                outcome: DeliveryOutcome::Success,
                detail,
            },
            Some(EXIT_TEMPFAIL) => SendResult {
                outcome: DeliveryOutcome::TransientFailure,
                detail: detail.or_else(|| Some("carrier asked to retry".to_string())),
            },
            Some(code) => SendResult {
                outcome: DeliveryOutcome::PermanentFailure,
                detail: detail.or_else(|| Some(format!("exit status {code}"))),
            },
            None => SendResult::transient("transport killed by signal"),
        }
    }
}

/// Prints the alert locally and rings the terminal bell.
#[derive(Debug, Default)]
pub struct ConsoleTransport;

#[async_trait]
impl MessageTransport for ConsoleTransport {
    async fn send(
        &self,
        channel: Channel,
        recipient: &str,
        body: &str,
        attachment: Option<&str>,
    ) -> SendResult {
        warn!(
            %channel,
            recipient,
            attachment = attachment.unwrap_or("-"),
            "no transport configured, alert shown locally: {body}"
        );
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "\x07");
        let _ = stderr.flush();
        SendResult::success()
    }
}
