//! Recovery of `sessionId:vendorUrl` from the opaque user-context blob that accompanies
//! proof-verification callbacks.
//!
//! The blob is either plain text or hex with some leading padding or length prefix.
//! The payload start is found heuristically as the first run of four printable bytes, so
//! padding that happens to contain such a run will misparse.

use serde::Serialize;

const PRINTABLE_RUN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub session_id: Option<String>,
    pub vendor_url: String,
}

pub fn decode_user_context(raw: &str) -> UserContext {
    split_context(&decode_text(raw))
}

fn decode_text(raw: &str) -> String {
    let body = raw.strip_prefix("0x").unwrap_or(raw);
    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        return raw.to_string();
    }

    // An odd trailing nibble carries no whole byte and is dropped.
    let whole = &body[..body.len() - body.len() % 2];
    let bytes = match hex::decode(whole) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!("User context is not decodable hex, using it verbatim: {}", e);
            return raw.to_string();
        }
    };

    let start = bytes
        .windows(PRINTABLE_RUN)
        .position(|w| w.iter().all(|b| is_printable(*b)))
        .unwrap_or(0);

    String::from_utf8_lossy(&bytes[start..])
        .chars()
        .filter(|c| c.is_ascii() && is_printable(*c as u8))
        .collect()
}

fn split_context(text: &str) -> UserContext {
    match text.split_once(':') {
        Some((session_id, vendor_url)) => UserContext {
            session_id: Some(session_id.to_string()),
            vendor_url: vendor_url.to_string(),
        },
        None => UserContext { session_id: None, vendor_url: text.to_string() },
    }
}

fn is_printable(b: u8) -> bool {
    (0x20..=0x7e).contains(&b)
}
