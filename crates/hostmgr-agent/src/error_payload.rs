//! Structured error payload carried in RPC status messages.
//!
//! The control plane decodes this to decide whether a command may be
//! redelivered.

pub const PREFIX: &str = "HOSTMGR_ERROR_JSON:";

const MAX_MESSAGE_BYTES: usize = 16 * 1024;
const MAX_HINT_BYTES: usize = 4 * 1024;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub fn encode(code: &str, message: impl Into<String>, retryable: bool, hint: Option<String>) -> String {
    let payload = ErrorPayload {
        code: code.to_string(),
        message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
        retryable,
        hint: hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
    };

    let json = serde_json::to_string(&payload).unwrap_or_else(|_| {
        "{\"code\":\"internal\",\"message\":\"serialize_failed\",\"retryable\":true}".to_string()
    });

    format!("{PREFIX}{json}")
}

pub fn decode(message: &str) -> Option<ErrorPayload> {
    let json = message.strip_prefix(PREFIX)?;
    serde_json::from_str(json).ok()
}
