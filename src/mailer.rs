use crate::config::EmailConfig;
use async_trait::async_trait;
use lettre::address::AddressError;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tracing::{debug, info};

const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid email address '{address}': {source}")]
    Address {
        address: String,
        source: AddressError,
    },
    #[error("failed to build message: {0}")]
    Build(String),
    #[error("failed to read attachment {path}: {source}")]
    Attachment {
        path: String,
        source: std::io::Error,
    },
    #[error("smtp transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("smtp send timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
        attachment: Option<&Path>,
    ) -> Result<(), MailError>;
}

/// SMTP delivery over STARTTLS.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    timeout: Duration,
}

impl SmtpMailer {
    pub fn new(cfg: &EmailConfig) -> Result<Self, MailError> {
        let from = parse_mailbox(&cfg.from)?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.smtp_host)?
            .port(cfg.smtp_port)
            .timeout(Some(cfg.timeout));

        if !cfg.username.trim().is_empty() {
            match cfg.resolve_password() {
                Some(password) => {
                    builder = builder.credentials(Credentials::new(cfg.username.clone(), password));
                }
                None => {
                    debug!(env = %cfg.password_env, "smtp username set without password, sending unauthenticated");
                }
            }
        }

        Ok(Self {
            transport: builder.build(),
            from,
            timeout: cfg.timeout,
        })
    }

    async fn build_message(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
        attachment: Option<&Path>,
    ) -> Result<Message, MailError> {
        let builder = Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(to)?)
            .subject(subject);
        let html = SinglePart::html(html_body.to_string());

        let message = match attachment {
            Some(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|source| MailError::Attachment {
                        path: path.display().to_string(),
                        source,
                    })?;
                let filename = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("report.xlsx")
                    .to_string();
                let content_type = ContentType::parse(XLSX_CONTENT_TYPE)
                    .map_err(|err| MailError::Build(err.to_string()))?;
                builder.multipart(
                    MultiPart::mixed()
                        .singlepart(html)
                        .singlepart(Attachment::new(filename).body(bytes, content_type)),
                )
            }
            None => builder.singlepart(html),
        };

        message.map_err(|err| MailError::Build(err.to_string()))
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
        attachment: Option<&Path>,
    ) -> Result<(), MailError> {
        let message = self.build_message(to, subject, html_body, attachment).await?;
        match time::timeout(self.timeout, self.transport.send(message)).await {
            Ok(Ok(response)) => {
                info!(to = %to, subject = %subject, code = %response.code(), "email sent");
                Ok(())
            }
            Ok(Err(err)) => Err(MailError::Transport(err)),
            Err(_elapsed) => Err(MailError::Timeout(self.timeout)),
        }
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailError> {
    address
        .trim()
        .parse::<Mailbox>()
        .map_err(|source| MailError::Address {
            address: address.to_string(),
            source,
        })
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct SentMail {
        pub to: String,
        pub subject: String,
        pub html_body: String,
        pub attachment: Option<PathBuf>,
    }

    /// Records every message instead of delivering it.
    #[derive(Debug, Default)]
    pub struct RecordingMailer {
        sent: Mutex<Vec<SentMail>>,
        fail: AtomicBool,
    }

    impl RecordingMailer {
        pub fn failing() -> Self {
            let mailer = Self::default();
            mailer.fail.store(true, Ordering::SeqCst);
            mailer
        }

        pub async fn sent(&self) -> Vec<SentMail> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl MailTransport for RecordingMailer {
        async fn send(
            &self,
            to: &str,
            subject: &str,
            html_body: &str,
            attachment: Option<&Path>,
        ) -> Result<(), MailError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(MailError::Timeout(Duration::from_secs(1)));
            }
            self.sent.lock().await.push(SentMail {
                to: to.to_string(),
                subject: subject.to_string(),
                html_body: html_body.to_string(),
                attachment: attachment.map(Path::to_path_buf),
            });
            Ok(())
        }
    }
}
