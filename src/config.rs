//! Run configuration.
//!
//! Everything the pipeline needs from the environment is read once at startup
//! and validated before any network I/O happens. Mail settings and sheet
//! settings are loaded separately so a broken sheet setup can still be
//! reported by email.

use anyhow::{anyhow, Context, Result};
use lettre::message::Mailbox;
use std::fmt;
use std::path::PathBuf;

pub const SENDER_EMAIL_VAR: &str = "MY_DATA_SCIENCE_EMAIL";
pub const SENDER_PASSWORD_VAR: &str = "MY_DATA_SCIENCE_EMAIL_PASSWORD";
pub const RECIPIENT_EMAIL_VAR: &str = "MY_PERSONAL_EMAIL";
pub const CREDENTIALS_PATH_VAR: &str = "GOOGLE_CREDENTIALS_PATH";
pub const SPREADSHEET_NAME_VAR: &str = "AE_SPREADSHEET_NAME";
pub const WORKSHEET_NAME_VAR: &str = "AE_WORKSHEET_NAME";

const DEFAULT_CREDENTIALS_PATH: &str = "credentials.json";
const DEFAULT_SHEET_NAME: &str = "drug_adverse_events_children";

/// Rows per spreadsheet write.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// SMTP sender/recipient settings.
#[derive(Clone)]
pub struct MailConfig {
    pub sender: Mailbox,
    pub secret: String,
    pub recipient: Mailbox,
}

// Hand-written so the secret never ends up in logs.
impl fmt::Debug for MailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailConfig")
            .field("sender", &self.sender.to_string())
            .field("secret", &"<redacted>")
            .field("recipient", &self.recipient.to_string())
            .finish()
    }
}

impl MailConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let sender = required(&lookup, SENDER_EMAIL_VAR)?;
        let secret = required(&lookup, SENDER_PASSWORD_VAR)?;
        let recipient = required(&lookup, RECIPIENT_EMAIL_VAR)?;

        Ok(Self {
            sender: parse_mailbox(SENDER_EMAIL_VAR, &sender)?,
            secret,
            recipient: parse_mailbox(RECIPIENT_EMAIL_VAR, &recipient)?,
        })
    }
}

/// Spreadsheet target settings.
#[derive(Debug, Clone)]
pub struct SheetConfig {
    pub credentials_path: PathBuf,
    pub spreadsheet: String,
    pub worksheet: String,
    pub batch_size: usize,
}

impl SheetConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let credentials_path = optional(&lookup, CREDENTIALS_PATH_VAR)
            .unwrap_or_else(|| DEFAULT_CREDENTIALS_PATH.to_string());
        let spreadsheet = optional(&lookup, SPREADSHEET_NAME_VAR)
            .unwrap_or_else(|| DEFAULT_SHEET_NAME.to_string());
        let worksheet = optional(&lookup, WORKSHEET_NAME_VAR)
            .unwrap_or_else(|| DEFAULT_SHEET_NAME.to_string());

        let credentials_path = PathBuf::from(credentials_path);
        if !credentials_path.is_file() {
            anyhow::bail!(
                "Service account credentials not found at {:?} (set {})",
                credentials_path,
                CREDENTIALS_PATH_VAR
            );
        }

        Ok(Self {
            credentials_path,
            spreadsheet,
            worksheet,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    optional(lookup, key).ok_or_else(|| anyhow!("{} environment variable not set", key))
}

/// Blank values count as unset.
fn optional(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_mailbox(key: &str, value: &str) -> Result<Mailbox> {
    value
        .parse::<Mailbox>()
        .with_context(|| format!("{} is not a valid email address: {:?}", key, value))
}
