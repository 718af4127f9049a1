//! Inbound messages, and the fixed plain-text layout they are handed to the
//! mail command in.

use std::fmt;

use serde::de::{Deserialize, Deserializer, IgnoredAny, MapAccess, Visitor};

/// How much of a payload that failed to parse gets quoted in the
/// malformed-message notification.
pub const MAX_EXCERPT_BYTES: usize = 10 * 1024;

/// `From` line used when a payload can't be parsed.
pub const MALFORMED_SENDER: &str = "Unknown";

/// `Subject` line used when a payload can't be parsed.
pub const MALFORMED_SUBJECT: &str = "claptrap-listen: A malformed message was received";

/// A message as submitted by a client: a JSON object with `From`, `Subject`
/// and `Body` string fields.
///
/// Field names are matched case-insensitively, unknown fields are ignored,
/// and absent or `null` fields are left empty.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: String,
    pub subject: String,
    pub body: String,
}

impl<'de> Deserialize<'de> for InboundMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // a bare `null` is accepted, and yields an empty message
        deserializer.deserialize_option(InboundMessageVisitor)
    }
}

struct InboundMessageVisitor;

impl<'de> Visitor<'de> for InboundMessageVisitor {
    type Value = InboundMessage;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an object with From, Subject and Body fields")
    }

    fn visit_none<E>(self) -> Result<InboundMessage, E> {
        Ok(InboundMessage::default())
    }

    fn visit_unit<E>(self) -> Result<InboundMessage, E> {
        Ok(InboundMessage::default())
    }

    fn visit_some<D>(self, deserializer: D) -> Result<InboundMessage, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }

    fn visit_map<A>(self, mut map: A) -> Result<InboundMessage, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut message = InboundMessage::default();

        while let Some(key) = map.next_key::<String>()? {
            let field = if key.eq_ignore_ascii_case("from") {
                &mut message.from
            } else if key.eq_ignore_ascii_case("subject") {
                &mut message.subject
            } else if key.eq_ignore_ascii_case("body") {
                &mut message.body
            } else {
                map.next_value::<IgnoredAny>()?;
                continue;
            };

            // `null` leaves whatever the field already held
            if let Some(value) = map.next_value::<Option<String>>()? {
                *field = value;
            }
        }

        Ok(message)
    }
}

/// Notification sent in place of a payload that couldn't be parsed.
///
/// The excerpt is kept as raw bytes, so it reaches the mail command exactly as
/// it was received, even if it isn't valid UTF-8 or the cut falls inside a
/// multi-byte character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedMessage {
    pub error: String,
    pub excerpt: Vec<u8>,
}

impl MalformedMessage {
    /// Build a notification for `raw`, quoting at most [`MAX_EXCERPT_BYTES`] of it.
    pub fn new(error: impl fmt::Display, raw: &[u8]) -> MalformedMessage {
        let cut = raw.len().min(MAX_EXCERPT_BYTES);
        MalformedMessage {
            error: error.to_string(),
            excerpt: raw[..cut].to_vec(),
        }
    }

    fn write_body(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(format!("Error message: {}\nFirst 10KB: ", self.error).as_bytes());
        output.extend_from_slice(&self.excerpt);
    }
}

/// Either a message that parsed, or the notification standing in for one that didn't.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Inbound(InboundMessage),
    Malformed(MalformedMessage),
}

impl Message {
    pub fn sender(&self) -> &str {
        match self {
            Message::Inbound(message) => &message.from,
            Message::Malformed(_) => MALFORMED_SENDER,
        }
    }

    pub fn subject(&self) -> &str {
        match self {
            Message::Inbound(message) => &message.subject,
            Message::Malformed(_) => MALFORMED_SUBJECT,
        }
    }

    /// Render the message as the text handed to the mail command:
    ///
    /// ```text
    /// Subject: <subject>
    ///
    /// From: <from>
    /// <body>
    /// ```
    ///
    /// Fields are not escaped; newlines in them pass straight through.
    ///
    /// Example
    ///
    /// ```
    /// use claptrap_listen::message;
    ///
    /// let msg = message::parse(br#"{"From":"a@b.com","Subject":"Hi","Body":"test"}"#);
    /// assert_eq!(msg.render(), b"Subject: Hi\n\nFrom: a@b.com\ntest");
    /// ```
    pub fn render(&self) -> Vec<u8> {
        let mut output =
            format!("Subject: {}\n\nFrom: {}\n", self.subject(), self.sender()).into_bytes();

        match self {
            Message::Inbound(message) => output.extend_from_slice(message.body.as_bytes()),
            Message::Malformed(malformed) => malformed.write_body(&mut output),
        }

        output
    }
}

/// Parse a raw payload. Never fails: anything that isn't a JSON object (or
/// `null`) of string fields becomes a [`MalformedMessage`].
///
/// Invalid UTF-8, and `\uXXXX` escapes of unpaired surrogates, are read as
/// U+FFFD rather than rejected.
pub fn parse(raw: &[u8]) -> Message {
    let err = match serde_json::from_slice::<InboundMessage>(raw) {
        Ok(message) => return Message::Inbound(message),
        Err(e) => e,
    };

    let repaired = replace_lone_surrogates(&String::from_utf8_lossy(raw));
    if repaired.as_bytes() != raw {
        if let Ok(message) = serde_json::from_str::<InboundMessage>(&repaired) {
            return Message::Inbound(message);
        }
    }

    // report the error for what was actually received
    Message::Malformed(MalformedMessage::new(err, raw))
}

/// Rewrite `\uXXXX` escapes of surrogates that aren't part of a valid pair as
/// `\uFFFD`. Other escapes, including escaped backslashes, are copied as-is.
fn replace_lone_surrogates(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('\\') {
        output.push_str(&rest[..pos]);
        let escape = &rest[pos..];

        let len = match unicode_escape(escape) {
            Some(0xD800..=0xDBFF)
                if matches!(unicode_escape(&escape[6..]), Some(0xDC00..=0xDFFF)) =>
            {
                output.push_str(&escape[..12]);
                12
            }
            Some(0xD800..=0xDFFF) => {
                output.push_str("\\uFFFD");
                6
            }
            Some(_) => {
                output.push_str(&escape[..6]);
                6
            }
            None => {
                // the backslash and whatever character it escapes
                let len = escape[1..].chars().next().map_or(1, |c| 1 + c.len_utf8());
                output.push_str(&escape[..len]);
                len
            }
        };
        rest = &escape[len..];
    }

    output.push_str(rest);
    output
}

/// Code unit of a `\uXXXX` escape at the start of `s`.
fn unicode_escape(s: &str) -> Option<u32> {
    let digits = s.strip_prefix("\\u")?.get(..4)?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}
