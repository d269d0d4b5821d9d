use mail_parser::{Address, MessageParser};
use serde::Serialize;

use crate::models::HeaderField;

pub const PREVIEW_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct ParsedAttachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ParsedEmail {
    pub sender: Option<String>,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub headers: Vec<HeaderField>,
    pub attachments: Vec<ParsedAttachment>,
}

impl ParsedEmail {
    pub fn preview(&self) -> String {
        let source = self
            .text_body
            .clone()
            .filter(|body| !body.trim().is_empty())
            .unwrap_or_else(|| match &self.html_body {
                Some(html) => html2text::from_read(html.as_bytes(), 80),
                None => String::new(),
            });

        truncate_on_word_boundary(&collapse_whitespace(&source), PREVIEW_MAX_CHARS)
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_on_word_boundary(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }

    let truncated: String = input.chars().take(max_chars).collect();
    let boundary = truncated.rfind(' ').unwrap_or(truncated.len());
    format!("{}…", &truncated[..boundary])
}

/// Parses raw message bytes into our domain shape. Never panics: a
/// malformed message yields an empty-ish `ParsedEmail` rather than an
/// error, matching the preview-path tolerance the spec requires.
pub fn parse(raw: &[u8]) -> ParsedEmail {
    std::panic::catch_unwind(|| parse_inner(raw)).unwrap_or_default()
}

fn parse_inner(raw: &[u8]) -> ParsedEmail {
    let Some(message) = MessageParser::default().parse(raw) else {
        return ParsedEmail {
            headers: extract_raw_headers(raw),
            ..Default::default()
        };
    };

    let (sender, sender_name) = message
        .from()
        .map(first_address)
        .unwrap_or((None, None));

    ParsedEmail {
        sender,
        sender_name,
        subject: message.subject().map(str::to_string),
        text_body: message.body_text(0).map(|s| s.to_string()),
        html_body: message.body_html(0).map(|s| s.to_string()),
        headers: extract_raw_headers(raw),
        attachments: message
            .attachments()
            .map(|part| ParsedAttachment {
                filename: part
                    .attachment_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| "attachment".to_string()),
                content_type: part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(sub) => format!("{}/{}", ct.ctype(), sub),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                bytes: part.contents().to_vec(),
            })
            .collect(),
    }
}

fn first_address(address: &Address) -> (Option<String>, Option<String>) {
    match address {
        Address::List(list) => list
            .first()
            .map(|addr| (addr.address().map(|s| s.to_string()), addr.name().map(|s| s.to_string())))
            .unwrap_or((None, None)),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter())
            .next()
            .map(|addr| (addr.address().map(|s| s.to_string()), addr.name().map(|s| s.to_string())))
            .unwrap_or((None, None)),
    }
}

/// Splits unfolded header lines straight from the raw bytes, independent of
/// mail-parser's decoded header model, so the stored headers are the
/// as-received name/value pairs the spec calls for.
fn extract_raw_headers(raw: &[u8]) -> Vec<HeaderField> {
    let text = String::from_utf8_lossy(raw);
    let Some(header_block) = text.split("\r\n\r\n").next().or_else(|| text.split("\n\n").next())
    else {
        return Vec::new();
    };

    let mut headers = Vec::new();
    let mut current: Option<(String, String)> = None;

    for line in header_block.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }

        if let Some((name, value)) = current.take() {
            headers.push(HeaderField { name, value });
        }

        if let Some((name, value)) = line.split_once(':') {
            current = Some((name.trim().to_string(), value.trim().to_string()));
        }
    }

    if let Some((name, value)) = current {
        headers.push(HeaderField { name, value });
    }

    headers
}
