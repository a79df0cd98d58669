use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::EmailSettings;
use crate::state::ParticipantRecord;

const SOS_SUBJECT: &str = "🚨 SOS Alert from Citizen Shield";

#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    /// Display name shown next to the sending account.
    pub from_name: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Email for the victim's emergency contact, or `None` if no address is on file.
pub fn sos_email(identity: &str, location_label: &str, record: &ParticipantRecord) -> Option<EmailMessage> {
    let to = record.emergency_email.clone()?;
    let phone = record.emergency_phone.as_deref().unwrap_or("not provided");
    Some(EmailMessage {
        from_name: format!("Citizen Shield - {}", identity),
        to,
        subject: SOS_SUBJECT.to_string(),
        body: format!(
            "User {} is in danger!\nLocation: {}\nEmergency Number: {}",
            identity, location_label, phone
        ),
    })
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address {0}")]
    Address(String),
    #[error("failed to build message: {0}")]
    Build(String),
    #[error("smtp transport: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Single delivery attempt.
    async fn send(&self, msg: &EmailMessage) -> Result<(), MailError>;
}

/// STARTTLS relay with username/password auth.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Address,
}

impl SmtpMailer {
    pub fn new(settings: &EmailSettings) -> Result<Self, MailError> {
        let sender: Address = settings
            .user
            .parse()
            .map_err(|_| MailError::Address(settings.user.clone()))?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_host)
            .map_err(|e| MailError::Transport(e.to_string()))?
            .port(settings.smtp_port)
            .credentials(Credentials::new(settings.user.clone(), settings.password.clone()))
            .build();
        Ok(Self { transport, sender })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, msg: &EmailMessage) -> Result<(), MailError> {
        let to: Address = msg
            .to
            .parse()
            .map_err(|_| MailError::Address(msg.to.clone()))?;
        let email = Message::builder()
            .from(Mailbox::new(Some(msg.from_name.clone()), self.sender.clone()))
            .to(Mailbox::new(None, to))
            .subject(msg.subject.clone())
            .body(msg.body.clone())
            .map_err(|e| MailError::Build(e.to_string()))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// Used when no SMTP credentials are configured.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, msg: &EmailMessage) -> Result<(), MailError> {
        info!(
            "Email delivery disabled; would send \"{}\" to {}",
            msg.subject, msg.to
        );
        Ok(())
    }
}

/// Bounded hand-off to a background delivery task. Enqueueing never waits.
#[derive(Clone)]
pub struct MailQueue {
    tx: mpsc::Sender<EmailMessage>,
}

impl MailQueue {
    /// Spawn the delivery worker. Must be called inside a tokio runtime.
    pub fn start(mailer: Arc<dyn Mailer>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<EmailMessage>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match mailer.send(&msg).await {
                    Ok(()) => info!("Email sent to {}", msg.to),
                    Err(e) => error!("Error sending email to {}: {}", msg.to, e),
                }
            }
        });
        Self { tx }
    }

    /// Queue a message; a full or closed queue drops it with a warning.
    pub fn enqueue(&self, msg: EmailMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!("Email queue full; dropping message to {}", msg.to);
                false
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => {
                warn!("Email worker stopped; dropping message to {}", msg.to);
                false
            }
        }
    }
}
