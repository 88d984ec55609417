//! Internal module for parsing message headers.

use chrono::{DateTime, Utc};
use mailparse::{parse_headers, MailHeaderMap};
use tracing::warn;

/// Header fields the pipeline reads from raw message bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct HeaderSummary {
    /// `Message-ID` without angle brackets.
    pub message_id: Option<String>,
    /// Decoded subject.
    pub subject: Option<String>,
    /// `From` header, decoded.
    pub from: Option<String>,
    /// `Date` header.
    pub date: Option<DateTime<Utc>>,
}

/// Reads the header block of `raw`.
///
/// Malformed headers are logged and yield an empty summary so the message can
/// still be stored under its content hash.
pub(crate) fn summarize_headers(raw: &[u8]) -> HeaderSummary {
    let headers = match parse_headers(raw) {
        Ok((headers, _)) => headers,
        Err(e) => {
            warn!(error = %e, "Failed to parse message headers");
            return HeaderSummary::default();
        }
    };

    HeaderSummary {
        message_id: headers
            .get_first_value("Message-ID")
            .and_then(|id| normalize_message_id(&id)),
        subject: headers.get_first_value("Subject").filter(|s| !s.is_empty()),
        from: headers.get_first_value("From").filter(|s| !s.is_empty()),
        date: headers.get_first_value("Date").and_then(|d| parse_date(&d)),
    }
}

/// Strips whitespace and angle brackets; `None` if nothing is left.
pub(crate) fn normalize_message_id(raw: &str) -> Option<String> {
    let id = raw
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Parses an RFC 5322 date.
pub(crate) fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    mailparse::dateparse(value)
        .ok()
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
}

/// Decodes an RFC 2047 encoded header value (`=?UTF-8?B?...?=`).
pub(crate) fn decode_header_value(raw: &[u8]) -> String {
    let mut line = b"X: ".to_vec();
    line.extend_from_slice(raw);
    match mailparse::parse_header(&line) {
        Ok((header, _)) => header.get_value(),
        Err(_) => String::from_utf8_lossy(raw).into_owned(),
    }
}
