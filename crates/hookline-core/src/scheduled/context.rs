//! Per-recipient template context
//!
//! Builds the personalized lure URL, tracking pixel, QR code and `rd`
//! redirect token that message templates reference.

use super::qr::QrImage;
use super::template::{self, TemplateData, TemplateError};
use super::tracking::{
    add_phish_params, decode_phish_params, set_sorted_query, RedirectCipher, REDIRECT_PARAM,
};
use hookline_common::types::{Mailbox, Recipient};
use hookline_storage::models::{CampaignContext, SendingProfile, Template};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;
use url::Url;

/// Prefix of result ids used by test sends
pub const PREVIEW_PREFIX: &str = "preview-";

/// Context construction errors
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("invalid from address: {0:?}")]
    InvalidFromAddress(String),

    #[error("invalid URL {0}")]
    InvalidUrl(String),

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("QR code error: {0}")]
    Qr(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("no {0} template body specified")]
    MissingBody(&'static str),
}

/// Anything a phishing context can be built for
pub trait TemplateContext {
    fn from_address(&self) -> &str;

    /// URL template the lure link is built from
    fn base_url(&self) -> &str;

    /// URL template the tracking pixel is built from
    fn tracking_url(&self) -> &str;

    /// QR code size in pixels, empty for no QR code
    fn qr_size(&self) -> &str;

    /// Redirect target to carry as an encrypted `rd` parameter
    fn tracked_redirect(&self) -> Option<&str> {
        None
    }
}

impl TemplateContext for CampaignContext {
    fn from_address(&self) -> &str {
        match (&self.smtp, &self.sms) {
            (Some(smtp), _) => &smtp.from_address,
            (None, Some(sms)) => &sms.from_number,
            (None, None) => "",
        }
    }

    fn base_url(&self) -> &str {
        if self.campaign.landing_url.is_empty() {
            &self.campaign.url
        } else {
            &self.campaign.landing_url
        }
    }

    // Tracking always points at the main server, never the landing domain
    fn tracking_url(&self) -> &str {
        if self.campaign.url.is_empty() {
            self.base_url()
        } else {
            &self.campaign.url
        }
    }

    fn qr_size(&self) -> &str {
        &self.campaign.qr_size
    }

    fn tracked_redirect(&self) -> Option<&str> {
        if !self.campaign.is_tracking_only() {
            return None;
        }
        if self.campaign.redirect_url.is_empty() {
            warn!(
                campaign_id = %self.campaign.id,
                "Tracking only campaign has no redirect URL"
            );
            return None;
        }
        Some(&self.campaign.redirect_url)
    }
}

/// A one-off test send through a sending profile
#[derive(Debug, Clone)]
pub struct TestSendRequest {
    pub template: Template,
    pub smtp: SendingProfile,
    pub url: String,
    /// Overrides the profile's from address when non-empty
    pub from_address: String,
    pub recipient: Recipient,
    pub r_id: String,
    pub qr_size: String,
}

impl TestSendRequest {
    pub fn new(
        template: Template,
        smtp: SendingProfile,
        url: impl Into<String>,
        recipient: Recipient,
    ) -> Self {
        Self {
            template,
            smtp,
            url: url.into(),
            from_address: String::new(),
            recipient,
            r_id: format!("{}{}", PREVIEW_PREFIX, crate::token::random_token(7)),
            qr_size: String::new(),
        }
    }

    pub fn with_from_address(mut self, from: impl Into<String>) -> Self {
        self.from_address = from.into();
        self
    }

    pub fn with_qr_size(mut self, size: u32) -> Self {
        self.qr_size = if size == 0 { String::new() } else { size.to_string() };
        self
    }
}

impl TemplateContext for TestSendRequest {
    fn from_address(&self) -> &str {
        if self.from_address.is_empty() {
            &self.smtp.from_address
        } else {
            &self.from_address
        }
    }

    fn base_url(&self) -> &str {
        &self.url
    }

    fn tracking_url(&self) -> &str {
        &self.url
    }

    fn qr_size(&self) -> &str {
        &self.qr_size
    }
}

/// Stub used to check that a template renders
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub from_address: String,
    pub base_url: String,
}

impl Default for ValidationContext {
    fn default() -> Self {
        Self {
            from_address: "foo@bar.com".to_string(),
            base_url: "http://example.com".to_string(),
        }
    }
}

impl TemplateContext for ValidationContext {
    fn from_address(&self) -> &str {
        &self.from_address
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn tracking_url(&self) -> &str {
        &self.base_url
    }

    fn qr_size(&self) -> &str {
        "150"
    }
}

/// Everything a message template can reference for one recipient
#[derive(Debug, Clone, Serialize)]
pub struct PhishingTemplateContext {
    /// Sender display name, or the bare address when there is none
    pub from: String,
    pub url: String,
    pub qr: String,
    pub qr_base64: String,
    pub qr_name: String,
    pub tracker: String,
    pub tracking_url: String,
    pub r_id: String,
    /// Scheme and host of the lure URL
    pub base_url: String,
    #[serde(flatten)]
    pub recipient: Recipient,
}

impl PhishingTemplateContext {
    /// Build the context for an email
    pub fn new<C: TemplateContext + ?Sized>(
        ctx: &C,
        recipient: &Recipient,
        rid: &str,
        cipher: &RedirectCipher,
    ) -> Result<Self, ContextError> {
        let from = Mailbox::parse(ctx.from_address())
            .ok_or_else(|| ContextError::InvalidFromAddress(ctx.from_address().to_string()))?;

        let (base_url, mut lure) = lure_url(ctx, recipient, rid)?;

        // Appended after the phish params so it stays a plain parameter
        if let Some(redirect) = ctx.tracked_redirect() {
            let mut query: BTreeMap<String, String> = lure.query_pairs().into_owned().collect();
            query.insert(REDIRECT_PARAM.to_string(), cipher.encrypt(redirect));
            set_sorted_query(&mut lure, &query);
        }
        let url = lure.to_string();

        let rendered = template::render(ctx.tracking_url(), recipient)?;
        let mut tracking = parse_url(&rendered)?;
        let mut params = BTreeMap::new();
        params.insert("rid".to_string(), rid.to_string());
        params.insert("o".to_string(), "track".to_string());
        add_phish_params(&mut tracking, &params);
        let tracking_url = tracking.to_string();

        let (qr, qr_base64, qr_name) = if ctx.qr_size().is_empty() {
            (String::new(), String::new(), String::new())
        } else {
            let image = QrImage::render(&url, ctx.qr_size())?;
            (image.html(), image.base64, image.name)
        };

        Ok(Self {
            from: from.display_name(),
            tracker: format!("<img alt='' style='display: none' src='{}'/>", tracking_url),
            url,
            qr,
            qr_base64,
            qr_name,
            tracking_url,
            r_id: rid.to_string(),
            base_url,
            recipient: recipient.clone(),
        })
    }

    /// Build the context for an SMS: lure URL only, raw sender
    pub fn new_sms<C: TemplateContext + ?Sized>(
        ctx: &C,
        recipient: &Recipient,
        rid: &str,
    ) -> Result<Self, ContextError> {
        let (base_url, lure) = lure_url(ctx, recipient, rid)?;

        Ok(Self {
            from: ctx.from_address().to_string(),
            url: lure.to_string(),
            qr: String::new(),
            qr_base64: String::new(),
            qr_name: String::new(),
            tracker: String::new(),
            tracking_url: String::new(),
            r_id: rid.to_string(),
            base_url,
            recipient: recipient.clone(),
        })
    }

    /// The QR code, when one was rendered
    pub fn qr_image(&self) -> Option<QrImage> {
        (!self.qr_base64.is_empty()).then(|| QrImage {
            base64: self.qr_base64.clone(),
            name: self.qr_name.clone(),
        })
    }
}

impl TemplateData for PhishingTemplateContext {
    fn field(&self, name: &str) -> Option<String> {
        let value = match name {
            "From" => &self.from,
            "URL" => &self.url,
            "QR" => &self.qr,
            "QRBase64" => &self.qr_base64,
            "QRName" => &self.qr_name,
            "Tracker" => &self.tracker,
            "TrackingURL" => &self.tracking_url,
            "RId" => &self.r_id,
            "BaseURL" => &self.base_url,
            _ => return self.recipient.field(name),
        };
        Some(value.clone())
    }
}

/// Render a template against the validation stub, rejecting templates that
/// reference unknown fields
pub fn validate_template(text: &str, cipher: &RedirectCipher) -> Result<(), ContextError> {
    let recipient = Recipient::new("foo@bar.com")
        .with_name("Foo", "Bar")
        .with_position("Test");
    let ptx =
        PhishingTemplateContext::new(&ValidationContext::default(), &recipient, "123456", cipher)?;
    template::render(text, &ptx)?;
    Ok(())
}

fn parse_url(s: &str) -> Result<Url, ContextError> {
    Url::parse(s).map_err(|e| ContextError::InvalidUrl(format!("{:?}: {}", s, e)))
}

// Returns the origin of the rendered base URL and the personalized lure URL
fn lure_url<C: TemplateContext + ?Sized>(
    ctx: &C,
    recipient: &Recipient,
    rid: &str,
) -> Result<(String, Url), ContextError> {
    let rendered = template::render(ctx.base_url(), recipient)?;
    let mut lure = parse_url(&rendered)?;
    let base_url = lure.origin().ascii_serialization();

    let mut params = BTreeMap::new();
    let mut plain = BTreeMap::new();
    for (key, value) in lure.query_pairs() {
        match decode_phish_params(&value) {
            Some(decoded) => params.extend(decoded),
            None => {
                plain.entry(key.into_owned()).or_insert_with(|| value.into_owned());
            }
        }
    }
    set_sorted_query(&mut lure, &plain);

    params.insert("fname".to_string(), recipient.first_name.clone());
    params.insert("lname".to_string(), recipient.last_name.clone());
    params.insert("email".to_string(), recipient.email.clone());
    params.insert("rid".to_string(), rid.to_string());
    add_phish_params(&mut lure, &params);

    Ok((base_url, lure))
}
