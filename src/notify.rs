//! Email notifications for run outcomes.

use crate::config::MailConfig;
use anyhow::{Context, Result};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::path::{Path, PathBuf};
use tracing::info;

pub const SMTP_RELAY: &str = "smtp.gmail.com";
pub const SMTP_PORT: u16 = 587;

const JOB_NAME: &str = "drug_adverse_events_children";

/// One outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub attachment: Option<PathBuf>,
}

impl Notification {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            attachment: None,
        }
    }

    pub fn success() -> Self {
        Self::new(
            format!("Notebook Execution Successful: {}", JOB_NAME),
            format!("The Jupyter notebook {} executed successfully.", JOB_NAME),
        )
    }

    pub fn failure() -> Self {
        Self::new(
            format!("Notebook Execution Failed: {}", JOB_NAME),
            format!("There was an error executing the Jupyter notebook {}.", JOB_NAME),
        )
    }

    #[cfg(test)]
    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachment = Some(path.into());
        self
    }
}

/// Delivers notifications to the configured recipient.
#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Authenticated STARTTLS SMTP delivery.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    recipient: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &MailConfig) -> Result<Self> {
        let credentials = Credentials::new(config.sender.email.to_string(), config.secret.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(SMTP_RELAY)
            .context("Failed to configure SMTP relay")?
            .port(SMTP_PORT)
            .credentials(credentials)
            .build();

        Ok(Self {
            transport,
            sender: config.sender.clone(),
            recipient: config.recipient.clone(),
        })
    }
}

#[async_trait::async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let message = build_message(&self.sender, &self.recipient, notification)?;
        self.transport
            .send(message)
            .await
            .context("Failed to send email")?;
        info!("Sent email '{}' to {}", notification.subject, self.recipient);
        Ok(())
    }
}

/// Build the MIME message: plain-text body plus the optional attachment.
pub fn build_message(
    sender: &Mailbox,
    recipient: &Mailbox,
    notification: &Notification,
) -> Result<Message> {
    let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(notification.body.clone()));

    if let Some(path) = &notification.attachment {
        parts = parts.singlepart(attachment_part(path)?);
    }

    Message::builder()
        .from(sender.clone())
        .to(recipient.clone())
        .subject(notification.subject.clone())
        .multipart(parts)
        .context("Failed to build email message")
}

fn attachment_part(path: &Path) -> Result<SinglePart> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read attachment: {:?}", path))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "attachment".to_string());
    let content_type = ContentType::parse("application/octet-stream")
        .context("Invalid attachment content type")?;

    Ok(Attachment::new(filename).body(content, content_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox(addr: &str) -> Mailbox {
        addr.parse().unwrap()
    }

    fn rendered(message: &Message) -> String {
        String::from_utf8_lossy(&message.formatted()).to_string()
    }

    #[test]
    fn test_fixed_subjects() {
        assert_eq!(
            Notification::success().subject,
            "Notebook Execution Successful: drug_adverse_events_children"
        );
        assert_eq!(
            Notification::failure().body,
            "There was an error executing the Jupyter notebook drug_adverse_events_children."
        );
    }

    #[test]
    fn test_build_plain_message() {
        let message = build_message(
            &mailbox("sender@example.com"),
            &mailbox("ops@example.com"),
            &Notification::new("Run ok", "All rows uploaded."),
        )
        .unwrap();

        let text = rendered(&message);
        assert!(text.contains("Subject: Run ok"));
        assert!(text.contains("From: sender@example.com"));
        assert!(text.contains("To: ops@example.com"));
        assert!(text.contains("All rows uploaded."));
    }

    #[test]
    fn test_build_message_with_attachment() {
        let path = std::env::temp_dir().join("pediatric_ae_sync_attachment.log");
        std::fs::write(&path, "log line\n").unwrap();

        let message = build_message(
            &mailbox("sender@example.com"),
            &mailbox("ops@example.com"),
            &Notification::failure().with_attachment(&path),
        )
        .unwrap();

        let text = rendered(&message);
        assert!(text.contains("pediatric_ae_sync_attachment.log"));
        assert!(text.contains("attachment"));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_attachment_is_error() {
        let result = build_message(
            &mailbox("sender@example.com"),
            &mailbox("ops@example.com"),
            &Notification::failure().with_attachment("/nonexistent/file.txt"),
        );
        assert!(result.is_err());
    }
}
