//! Message generation - Renders templates into ready-to-send messages

use super::context::{ContextError, PhishingTemplateContext, TemplateContext};
use super::template;
use super::tracking::RedirectCipher;
use hookline_common::types::Recipient;
use hookline_storage::models::Template;

/// Value of the X-Mailer header on every generated email
pub const X_MAILER: &str = concat!("Hookline/", env!("CARGO_PKG_VERSION"));

/// Inline image referenced from the HTML body by Content-ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub name: String,
    pub content: Vec<u8>,
}

/// A rendered email
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub r_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub headers: Vec<(String, String)>,
    pub inline: Option<InlineImage>,
}

/// A rendered SMS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsMessage {
    pub r_id: String,
    pub from: String,
    pub to: String,
    pub body: String,
}

/// Render an email for one recipient.
///
/// Profile headers, subject and bodies are all templates. Any render error
/// aborts generation so nothing half-personalized is sent.
pub fn generate_email<C: TemplateContext + ?Sized>(
    ctx: &C,
    template: &Template,
    headers: &[(String, String)],
    recipient: &Recipient,
    rid: &str,
    cipher: &RedirectCipher,
) -> Result<EmailMessage, ContextError> {
    let ptx = PhishingTemplateContext::new(ctx, recipient, rid, cipher)?;

    let mut rendered_headers = Vec::with_capacity(headers.len() + 1);
    for (name, value) in headers {
        let name = template::render(name, &ptx)?;
        let value = template::render(value, &ptx)?;
        if !name.trim().is_empty() {
            rendered_headers.push((name, value));
        }
    }
    rendered_headers.push(("X-Mailer".to_string(), X_MAILER.to_string()));

    let text = render_optional(&template.text, &ptx)?;
    let html = render_optional(&template.html, &ptx)?;

    let inline = match ptx.qr_image() {
        Some(image) => Some(InlineImage {
            content: image.png()?,
            name: image.name,
        }),
        None => None,
    };

    Ok(EmailMessage {
        r_id: rid.to_string(),
        from: ctx.from_address().to_string(),
        to: recipient.format_address(),
        subject: template::render(&template.subject, &ptx)?,
        text,
        html,
        headers: rendered_headers,
        inline,
    })
}

/// Render an SMS for one recipient. The phone number is carried in the
/// recipient's email field.
pub fn generate_sms<C: TemplateContext + ?Sized>(
    ctx: &C,
    template: &Template,
    recipient: &Recipient,
    rid: &str,
) -> Result<SmsMessage, ContextError> {
    if template.text.is_empty() {
        return Err(ContextError::MissingBody("text"));
    }

    let ptx = PhishingTemplateContext::new_sms(ctx, recipient, rid)?;

    Ok(SmsMessage {
        r_id: rid.to_string(),
        from: ctx.from_address().to_string(),
        to: recipient.email.clone(),
        body: template::render(&template.text, &ptx)?,
    })
}

fn render_optional(
    body: &str,
    ptx: &PhishingTemplateContext,
) -> Result<Option<String>, ContextError> {
    if body.is_empty() {
        return Ok(None);
    }
    Ok(Some(template::render(body, ptx)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduled::context::ValidationContext;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn cipher() -> RedirectCipher {
        RedirectCipher::new(b"HooklineRedirectKey0123456789abc").unwrap()
    }

    fn template(subject: &str, text: &str, html: &str) -> Template {
        Template {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "payroll".to_string(),
            subject: subject.to_string(),
            text: text.to_string(),
            html: html.to_string(),
            modified_date: Utc::now(),
        }
    }

    fn context() -> ValidationContext {
        ValidationContext {
            from_address: "Payroll <payroll@example.net>".to_string(),
            base_url: "https://lure.example.net/pay".to_string(),
        }
    }

    #[test]
    fn test_generate_email_renders_everything() {
        let recipient = Recipient::new("sam@corp.example").with_name("Sam", "Lee");
        let headers = vec![
            ("X-Campaign-For".to_string(), "{{.Email}}".to_string()),
            ("{{.Nothing}}".to_string(), "x".to_string()),
        ];
        let tpl = template(
            "Pay slip for {{.FirstName}}",
            "Open {{.URL}}",
            "<p>{{.From}}</p>{{.Tracker}}",
        );

        let err =
            generate_email(&context(), &tpl, &headers, &recipient, "r1", &cipher()).unwrap_err();
        assert!(matches!(err, ContextError::Template(_)));

        let msg =
            generate_email(&context(), &tpl, &headers[..1], &recipient, "r1", &cipher()).unwrap();
        assert_eq!(msg.subject, "Pay slip for Sam");
        assert_eq!(msg.to, "\"Sam Lee\" <sam@corp.example>");
        assert_eq!(msg.from, "Payroll <payroll@example.net>");
        assert!(msg.text.unwrap().starts_with("Open https://lure.example.net/pay?um="));
        assert!(msg.html.unwrap().starts_with("<p>Payroll</p><img alt=''"));
        assert_eq!(
            msg.headers,
            vec![
                ("X-Campaign-For".to_string(), "sam@corp.example".to_string()),
                ("X-Mailer".to_string(), X_MAILER.to_string()),
            ]
        );
        assert!(msg.inline.is_some());
    }

    #[test]
    fn test_generate_email_omits_empty_bodies() {
        let recipient = Recipient::new("sam@corp.example");
        let plain = template("Hi", "just text", "");
        let msg = generate_email(&context(), &plain, &[], &recipient, "r2", &cipher()).unwrap();
        assert_eq!(msg.text.as_deref(), Some("just text"));
        assert_eq!(msg.html, None);
    }

    #[test]
    fn test_generate_sms() {
        let recipient = Recipient::new("+15550111").with_name("Ana", "");
        let text_only = template("", "Hi {{.FirstName}} {{.URL}}", "");
        let sms = generate_sms(&context(), &text_only, &recipient, "r3").unwrap();
        assert_eq!(sms.to, "+15550111");
        assert!(sms.body.starts_with("Hi Ana https://lure.example.net/pay?um="));

        let html_only = template("", "", "<p>html only</p>");
        let err = generate_sms(&context(), &html_only, &recipient, "r3").unwrap_err();
        assert!(matches!(err, ContextError::MissingBody("text")));
    }
}
