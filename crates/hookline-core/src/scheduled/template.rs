//! Template Renderer - Substitutes `{{.Field}}` placeholders

use hookline_common::types::Recipient;
use thiserror::Error;

/// Template rendering errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown template field: {0}")]
    UnknownField(String),

    #[error("unclosed action at byte {0}")]
    Unclosed(usize),

    #[error("unsupported template action: {0}")]
    Unsupported(String),
}

/// Values that can be referenced from a template
pub trait TemplateData {
    /// Value of a named field, `None` if the field does not exist
    fn field(&self, name: &str) -> Option<String>;
}

impl TemplateData for Recipient {
    fn field(&self, name: &str) -> Option<String> {
        match name {
            "Email" => Some(self.email.clone()),
            "FirstName" => Some(self.first_name.clone()),
            "LastName" => Some(self.last_name.clone()),
            "Position" => Some(self.position.clone()),
            _ => None,
        }
    }
}

/// Render a template against `data`.
///
/// Placeholders are `{{.Field}}` (surrounding whitespace and the leading dot
/// are optional). Referencing a field `data` does not have is an error.
pub fn render<D: TemplateData + ?Sized>(template: &str, data: &D) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);

        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or(TemplateError::Unclosed(offset + start))?;

        let action = after[..end].trim();
        let name = action.strip_prefix('.').unwrap_or(action);
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(TemplateError::Unsupported(action.to_string()));
        }

        let value = data
            .field(name)
            .ok_or_else(|| TemplateError::UnknownField(name.to_string()))?;
        out.push_str(&value);

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    out.push_str(rest);
    Ok(out)
}
