//! Normalized inbound email as delivered by the mailbox collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::lead::looks_like_email;
use crate::errors::ParseFailure;

const REPLY_PREFIXES: &[&str] = &["re:", "fw:", "fwd:", "aw:", "sv:"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: String,
    /// Raw `From` header, either `addr@host` or `Display Name <addr@host>`.
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub has_attachment: bool,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub references: Vec<String>,
    pub received_at: DateTime<Utc>,
}

/// Fields the rule matcher looks at, with the sender reduced to a bare address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedMessage {
    pub sender: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub body: String,
    pub has_attachment: bool,
}

impl InboundMessage {
    /// Replies are recognised by subject prefix or threading headers and skip rule matching.
    pub fn is_reply(&self) -> bool {
        let subject = self.subject.trim_start().to_ascii_lowercase();
        let prefixed = REPLY_PREFIXES.iter().any(|prefix| subject.starts_with(prefix));
        let threaded = self.in_reply_to.as_deref().is_some_and(|value| !value.trim().is_empty())
            || self.references.iter().any(|value| !value.trim().is_empty());
        prefixed || threaded
    }

    pub fn sender_address(&self) -> Result<String, ParseFailure> {
        split_sender(&self.from).map(|(address, _)| address)
    }

    pub fn normalize(&self) -> Result<NormalizedMessage, ParseFailure> {
        let (sender, sender_name) = split_sender(&self.from)?;
        let subject = self.subject.trim().to_string();
        let body = self.body_text.trim().to_string();
        if subject.is_empty() && body.is_empty() {
            return Err(ParseFailure::EmptyContent { message_id: self.message_id.clone() });
        }
        Ok(NormalizedMessage {
            sender,
            sender_name,
            subject,
            body,
            has_attachment: self.has_attachment,
        })
    }
}

fn split_sender(raw: &str) -> Result<(String, Option<String>), ParseFailure> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ParseFailure::MissingSender);
    }

    let (address, name) = match (raw.rfind('<'), raw.rfind('>')) {
        (Some(open), Some(close)) if open < close => {
            let name = raw[..open].trim().trim_matches('"').trim();
            let name = (!name.is_empty()).then(|| name.to_string());
            (raw[open + 1..close].trim(), name)
        }
        _ => (raw, None),
    };

    let address = address.to_ascii_lowercase();
    if !looks_like_email(&address) {
        return Err(ParseFailure::InvalidSender(raw.to_string()));
    }
    Ok((address, name))
}
