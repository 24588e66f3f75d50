// src/notify.rs
//
// Failure notifications. The SMTP transport lives outside this crate;
// the orchestrator only talks to `Notifier`. The default implementation
// writes to the log, which keeps FAILED transitions visible even with
// email disabled.

use crate::config::SmtpConfig;
use tracing::{error, info};

pub trait Notifier: Send + Sync {
    fn notify_failure(&self, package_name: &str, stage: &str, reason: &str);
}

/// Log-only notifier, used when ENABLE_EMAIL_NOTIFICATIONS is off or no
/// SMTP transport is wired in.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_failure(&self, package_name: &str, stage: &str, reason: &str) {
        error!("Package {package_name} FAILED at {stage}: {reason}");
    }
}

/// Formats the message an SMTP transport would send and hands it to the
/// injected sender. Keeping the send closure external means the mail
/// stack never becomes a dependency of the core.
pub struct EmailNotifier {
    config: SmtpConfig,
    send: Box<dyn Fn(&str, &[String], &str, &str) -> Result<(), String> + Send + Sync>,
}

impl EmailNotifier {
    pub fn new(
        config: SmtpConfig,
        send: Box<dyn Fn(&str, &[String], &str, &str) -> Result<(), String> + Send + Sync>,
    ) -> Self {
        Self { config, send }
    }
}

impl Notifier for EmailNotifier {
    fn notify_failure(&self, package_name: &str, stage: &str, reason: &str) {
        if !self.config.enabled || self.config.recipients.is_empty() {
            LogNotifier.notify_failure(package_name, stage, reason);
            return;
        }
        let subject = format!("[metacam-intake] {package_name} failed at {stage}");
        let body = format!(
            "Package: {package_name}\nStage: {stage}\nReason: {reason}\n\nSender: {}",
            self.config.sender
        );
        match (self.send)(&self.config.sender, &self.config.recipients, &subject, &body) {
            Ok(()) => info!("Failure notification sent for {package_name}"),
            Err(e) => error!("Failure notification could not be sent: {e}"),
        }
    }
}
