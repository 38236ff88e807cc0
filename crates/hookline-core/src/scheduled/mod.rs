//! Campaign scheduling - Send-time allocation, per-recipient context,
//! message generation and the delivery worker

mod allocator;
mod context;
mod manager;
mod message;
mod qr;
mod scheduler;
mod stop_hook;
mod template;
mod tracking;
mod transport;

pub use allocator::SendWindow;
pub use context::{
    validate_template, ContextError, PhishingTemplateContext, TemplateContext, TestSendRequest,
    ValidationContext, PREVIEW_PREFIX,
};
pub use manager::{CampaignError, CampaignManager, NewCampaign};
pub use message::{generate_email, generate_sms, EmailMessage, InlineImage, SmsMessage, X_MAILER};
pub use qr::QrImage;
pub use scheduler::{DeliveryWorker, DispatchStats, GroupReport};
pub use stop_hook::{HttpStopHook, NoopStopHook, StopHook};
pub use template::{render, TemplateData, TemplateError};
pub use tracking::{
    decode_phish_params, encode_phish_params, RedirectCipher, PHISH_PARAM, REDIRECT_PARAM,
};
pub use transport::{DeliveryResult, MailTransport, SmsTransport, SmtpTransport, TwilioSmsTransport};
