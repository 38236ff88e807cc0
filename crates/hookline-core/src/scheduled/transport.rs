//! Outbound transports - SMTP via lettre, SMS via the Twilio REST API

use super::message::{EmailMessage, SmsMessage};
use async_trait::async_trait;
use chrono::Utc;
use hookline_storage::models::{SendingProfile, SmsProfile};
use lettre::{
    message::{
        header::{ContentType, HeaderName, HeaderValue},
        Attachment, Mailbox, MultiPart, SinglePart,
    },
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
        extension::ClientId,
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of a delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// Successfully sent
    Sent { message_id: String },
    /// Temporarily failed, should retry
    TemporaryFailure { error: String },
    /// Permanently failed, should not retry
    PermanentFailure { error: String },
    /// Bounced
    Bounced { bounce_type: String, reason: String },
}

impl DeliveryResult {
    pub fn is_sent(&self) -> bool {
        matches!(self, DeliveryResult::Sent { .. })
    }
}

/// Sends a batch of emails through one sending profile.
///
/// Returns one result per message, in order. A shorter result list means the
/// remaining messages were not attempted.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send_batch(
        &self,
        profile: &SendingProfile,
        messages: Vec<EmailMessage>,
    ) -> Vec<DeliveryResult>;
}

/// Sends a batch of text messages through one SMS profile
#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send_batch(
        &self,
        profile: &SmsProfile,
        messages: Vec<SmsMessage>,
    ) -> Vec<DeliveryResult>;
}

/// SMTP transport
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    hello_name: String,
    timeout: Duration,
}

impl SmtpTransport {
    pub fn new(hello_name: impl Into<String>) -> Self {
        Self {
            hello_name: hello_name.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn mailer(
        &self,
        profile: &SendingProfile,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, String> {
        let port = u16::try_from(profile.port)
            .map_err(|_| format!("Invalid SMTP port: {}", profile.port))?;

        let tls_parameters = TlsParameters::builder(profile.host.clone())
            .dangerous_accept_invalid_certs(profile.ignore_cert_errors)
            .build()
            .map_err(|e| format!("Failed to build TLS parameters: {}", e))?;

        // Port 465 is implicit TLS, everything else upgrades when offered
        let tls = if port == 465 {
            Tls::Wrapper(tls_parameters)
        } else {
            Tls::Opportunistic(tls_parameters)
        };

        let mut transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&profile.host)
            .port(port)
            .tls(tls)
            .hello_name(ClientId::Domain(self.hello_name.clone()))
            .timeout(Some(self.timeout));

        if let (Some(username), Some(password)) = (&profile.username, &profile.password) {
            if !username.is_empty() {
                transport =
                    transport.credentials(Credentials::new(username.clone(), password.clone()));
            }
        }

        Ok(transport.build())
    }

    fn build_message(&self, message: &EmailMessage, message_id: &str) -> Result<Message, String> {
        let from: Mailbox = message
            .from
            .parse()
            .map_err(|e| format!("Invalid from address: {}", e))?;
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|e| format!("Invalid to address: {}", e))?;

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(message.subject.clone())
            .message_id(Some(message_id.to_string()));

        for (name, value) in &message.headers {
            let name = HeaderName::new_from_ascii(name.clone())
                .map_err(|e| format!("Invalid header name {:?}: {}", name, e))?;
            builder = builder.raw_header(HeaderValue::new(name, value.clone()));
        }

        let body = match (&message.text, &message.html) {
            (Some(text), Some(html)) => MultiPart::alternative()
                .singlepart(SinglePart::plain(text.clone()))
                .singlepart(SinglePart::html(html.clone())),
            (None, Some(html)) => {
                MultiPart::alternative().singlepart(SinglePart::html(html.clone()))
            }
            (Some(text), None) => {
                MultiPart::alternative().singlepart(SinglePart::plain(text.clone()))
            }
            (None, None) => MultiPart::alternative().singlepart(SinglePart::plain(String::new())),
        };

        let email = match &message.inline {
            Some(image) => {
                let png = ContentType::parse("image/png").map_err(|e| e.to_string())?;
                let qr = Attachment::new_inline(image.name.clone())
                    .body(image.content.clone(), png);
                builder.multipart(MultiPart::related().multipart(body).singlepart(qr))
            }
            None => builder.multipart(body),
        };

        email.map_err(|e| format!("Failed to build email: {}", e))
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send_batch(
        &self,
        profile: &SendingProfile,
        messages: Vec<EmailMessage>,
    ) -> Vec<DeliveryResult> {
        let mailer = match self.mailer(profile) {
            Ok(mailer) => mailer,
            Err(error) => {
                warn!(profile = %profile.name, "Cannot create SMTP transport: {}", error);
                return messages
                    .iter()
                    .map(|_| DeliveryResult::TemporaryFailure { error: error.clone() })
                    .collect();
            }
        };

        let mut results = Vec::with_capacity(messages.len());
        for message in &messages {
            let message_id = format!(
                "<{}.{}@{}>",
                Uuid::new_v4(),
                Utc::now().timestamp(),
                self.hello_name
            );
            let email = match self.build_message(message, &message_id) {
                Ok(email) => email,
                Err(error) => {
                    results.push(DeliveryResult::PermanentFailure { error });
                    continue;
                }
            };

            let result = match mailer.send(email).await {
                Ok(response) => {
                    debug!(r_id = %message.r_id, "Email accepted: {:?}", response.code());
                    DeliveryResult::Sent { message_id }
                }
                Err(e) => classify_smtp_error(&e),
            };
            results.push(result);
        }

        results
    }
}

fn classify_smtp_error(e: &lettre::transport::smtp::Error) -> DeliveryResult {
    let error = e.to_string();
    if !e.is_permanent() {
        return DeliveryResult::TemporaryFailure { error };
    }

    if error.contains("5.1.1")
        || error.contains("User unknown")
        || error.contains("does not exist")
    {
        DeliveryResult::Bounced {
            bounce_type: "hard".to_string(),
            reason: error,
        }
    } else {
        DeliveryResult::PermanentFailure { error }
    }
}

/// SMS transport backed by the Twilio Messages API
#[derive(Debug, Clone)]
pub struct TwilioSmsTransport {
    client: reqwest::Client,
    api_base: String,
}

#[derive(Deserialize)]
struct TwilioMessage {
    sid: String,
}

impl TwilioSmsTransport {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    async fn send_one(&self, profile: &SmsProfile, message: &SmsMessage) -> DeliveryResult {
        let url = format!("{}/Accounts/{}/Messages.json", self.api_base, profile.account_sid);

        let response = self
            .client
            .post(&url)
            .basic_auth(&profile.account_sid, Some(&profile.auth_token))
            .form(&[
                ("To", message.to.as_str()),
                ("From", message.from.as_str()),
                ("Body", message.body.as_str()),
            ])
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return DeliveryResult::TemporaryFailure {
                    error: format!("SMS gateway request failed: {}", e),
                }
            }
        };

        let status = response.status();
        if status.is_success() {
            return match response.json::<TwilioMessage>().await {
                Ok(body) => DeliveryResult::Sent { message_id: body.sid },
                Err(e) => DeliveryResult::Sent {
                    message_id: format!("unknown ({})", e),
                },
            };
        }

        let error = format!(
            "SMS gateway returned {}: {}",
            status,
            response.text().await.unwrap_or_default()
        );
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            DeliveryResult::PermanentFailure { error }
        } else {
            DeliveryResult::TemporaryFailure { error }
        }
    }
}

#[async_trait]
impl SmsTransport for TwilioSmsTransport {
    async fn send_batch(
        &self,
        profile: &SmsProfile,
        messages: Vec<SmsMessage>,
    ) -> Vec<DeliveryResult> {
        let mut results = Vec::with_capacity(messages.len());
        for message in &messages {
            results.push(self.send_one(profile, message).await);
        }
        results
    }
}
