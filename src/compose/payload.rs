//! MIME-style message payload.
//!
//! ```text
//! MIME-Version: 1.0
//! Subject: <subject>
//! Content-Type: multipart/mixed; boundary="<boundary>"
//!
//! --<boundary>
//! Content-Type: text/plain; charset=utf-8
//!
//! <body>
//! --<boundary>
//! Content-Type: application/octet-stream
//! Content-Disposition: attachment; filename="<name>"
//! Content-Transfer-Encoding: base64
//!
//! <base64>
//! --<boundary>--
//! ```

use base64::Engine;
use rand::RngCore;

use crate::error::{Result, SealError};

const MAX_NAME_LEN: usize = 255;
const B64_LINE: usize = 76;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub subject: Option<String>,
    pub body: String,
    /// Text being replied to; rendered below the body as `> ` lines.
    pub quote: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl Payload {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Body with the quoted seed appended.
    pub fn full_text(&self) -> String {
        match &self.quote {
            Some(quote) => {
                let mut text = self.body.clone();
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                for line in quote.lines() {
                    text.push_str("> ");
                    text.push_str(line);
                    text.push('\n');
                }
                text
            }
            None => self.body.clone(),
        }
    }

    /// Assemble the payload. Attachments are inlined when `inline_attachments`.
    pub fn build(&self, inline_attachments: bool) -> Result<Vec<u8>> {
        if let Some(subject) = &self.subject {
            if subject.chars().any(char::is_control) {
                return Err(SealError::MimeBuildFailed(
                    "subject contains control characters".into(),
                ));
            }
        }
        self.check_attachment_names()?;

        let text = self.full_text();
        let attachments: &[Attachment] = if inline_attachments {
            &self.attachments
        } else {
            &[]
        };
        let boundary = boundary_for(&text);

        let mut out = String::from("MIME-Version: 1.0\r\n");
        if let Some(subject) = &self.subject {
            out.push_str(&format!("Subject: {}\r\n", subject));
        }
        out.push_str(&format!(
            "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n",
            boundary
        ));

        out.push_str(&format!("--{}\r\n", boundary));
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
        out.push_str(&text);
        out.push_str("\r\n");

        for attachment in attachments {
            out.push_str(&format!("--{}\r\n", boundary));
            out.push_str("Content-Type: application/octet-stream\r\n");
            out.push_str(&format!(
                "Content-Disposition: attachment; filename=\"{}\"\r\n",
                attachment.name
            ));
            out.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
            let b64 = base64::engine::general_purpose::STANDARD.encode(&attachment.content);
            for chunk in b64.as_bytes().chunks(B64_LINE) {
                out.push_str(&String::from_utf8_lossy(chunk));
                out.push_str("\r\n");
            }
        }
        out.push_str(&format!("--{}--\r\n", boundary));
        Ok(out.into_bytes())
    }

    fn check_attachment_names(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for attachment in &self.attachments {
            let name = &attachment.name;
            if name.is_empty() || name.len() > MAX_NAME_LEN {
                return Err(SealError::MimeBuildFailed(format!(
                    "attachment name '{}' has invalid length",
                    name
                )));
            }
            if name
                .chars()
                .any(|c| c.is_control() || matches!(c, '"' | '/' | '\\'))
            {
                return Err(SealError::MimeBuildFailed(format!(
                    "attachment name '{}' contains forbidden characters",
                    name.escape_default()
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(SealError::MimeBuildFailed(format!(
                    "duplicate attachment '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Parse a payload produced by [`Payload::build`].
    /// The quote is folded into the body.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| SealError::InvalidMessage("payload is not UTF-8".into()))?;
        let (headers, rest) = split_headers(text)?;

        let subject = header(headers, "Subject").map(str::to_string);
        let content_type = header(headers, "Content-Type")
            .ok_or_else(|| SealError::InvalidMessage("missing Content-Type".into()))?;
        let boundary = content_type
            .split("boundary=\"")
            .nth(1)
            .and_then(|b| b.split('"').next())
            .ok_or_else(|| SealError::InvalidMessage("missing multipart boundary".into()))?;

        let delimiter = format!("--{}", boundary);
        let terminator = format!("--{}--", boundary);
        let end = rest
            .find(&terminator)
            .ok_or_else(|| SealError::InvalidMessage("unterminated multipart body".into()))?;

        let mut payload = Payload {
            subject,
            ..Default::default()
        };
        let mut parts = rest[..end].split(&delimiter).skip(1);

        let first = parts
            .next()
            .ok_or_else(|| SealError::InvalidMessage("missing text part".into()))?;
        let (_, body) = split_headers(first.trim_start_matches("\r\n"))?;
        payload.body = body.strip_suffix("\r\n").unwrap_or(body).to_string();

        for part in parts {
            let (part_headers, content) = split_headers(part.trim_start_matches("\r\n"))?;
            let name = header(part_headers, "Content-Disposition")
                .and_then(|d| d.split("filename=\"").nth(1))
                .and_then(|n| n.split('"').next())
                .ok_or_else(|| SealError::InvalidMessage("attachment without filename".into()))?;
            let b64: String = content.lines().map(str::trim).collect();
            let content = base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|_| {
                    SealError::InvalidMessage(format!("attachment '{}' is not base64", name))
                })?;
            payload.attachments.push(Attachment {
                name: name.to_string(),
                content,
            });
        }
        Ok(payload)
    }
}

fn split_headers(text: &str) -> Result<(&str, &str)> {
    text.split_once("\r\n\r\n")
        .ok_or_else(|| SealError::InvalidMessage("missing header separator".into()))
}

fn header<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    headers.split("\r\n").find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

/// A boundary that does not occur in `text`.
fn boundary_for(text: &str) -> String {
    loop {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        let boundary = format!("sealpost-{}", hex::encode(bytes));
        if !text.contains(&boundary) {
            return boundary;
        }
    }
}
