//! Common types for Hookline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for users
pub type UserId = Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for target groups
pub type GroupId = Uuid;

/// Unique identifier for targets
pub type TargetId = Uuid;

/// Unique identifier for message templates
pub type TemplateId = Uuid;

/// Unique identifier for sending profiles (SMTP or SMS)
pub type ProfileId = Uuid;

/// Unique identifier for campaign results
pub type ResultId = Uuid;

/// Unique identifier for delivery units
pub type DeliveryUnitId = Uuid;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse a bare `local@domain` address
    pub fn parse(s: &str) -> Option<Self> {
        let (local, domain) = s.rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        if !local.chars().all(is_address_char) || !domain.chars().all(is_address_char) {
            return None;
        }
        if local.contains('@')
            || domain.starts_with('.')
            || domain.ends_with('.')
            || domain.contains("..")
        {
            return None;
        }
        Some(Self::new(local, domain))
    }
}

fn is_address_char(c: char) -> bool {
    !c.is_whitespace()
        && !c.is_control()
        && !matches!(c, '<' | '>' | '(' | ')' | ',' | ';' | ':' | '"' | '[' | ']' | '\\')
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.trim())
            .ok_or_else(|| crate::Error::Validation(format!("Invalid email address: {}", s)))
    }
}

/// An address with an optional display name, as found in a From header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub name: Option<String>,
    pub address: EmailAddress,
}

impl Mailbox {
    /// Parse `addr@host`, `<addr@host>` or `Display Name <addr@host>`
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(open) = s.rfind('<') {
            let inner = s[open + 1..].strip_suffix('>')?;
            let address = EmailAddress::parse(inner.trim())?;
            let name = s[..open].trim().trim_matches('"').trim();
            return Some(Self {
                name: (!name.is_empty()).then(|| name.to_string()),
                address,
            });
        }
        EmailAddress::parse(s).map(|address| Self { name: None, address })
    }

    /// Display name, falling back to the bare address
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }
}

impl std::str::FromStr for Mailbox {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation(format!("Invalid mailbox: {}", s)))
    }
}

/// Personalization fields shared by targets, results and test sends
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub position: String,
}

impl Recipient {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Default::default()
        }
    }

    /// Builder-style name setter
    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = first.into();
        self.last_name = last.into();
        self
    }

    /// Builder-style position setter
    pub fn with_position(mut self, position: impl Into<String>) -> Self {
        self.position = position.into();
        self
    }

    /// Address formatted for a To header
    pub fn format_address(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() {
            self.email.clone()
        } else {
            format!("\"{}\" <{}>", name, self.email)
        }
    }
}
