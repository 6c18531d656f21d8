/// Substrings that mark an upstream usage or rate limit.
///
/// Matching is case-sensitive: the collaborator exposes no structured error
/// code, only free text, so this list is a heuristic and may need to grow.
pub const QUOTA_SIGNATURES: &[&str] = &["quota", "limit", "exceeded", "RESOURCE_EXHAUSTED"];

/// Substrings that mark an upstream failure worth trying again later.
pub const TRANSIENT_SIGNATURES: &[&str] = &[
    "UNAVAILABLE",
    "DEADLINE_EXCEEDED",
    "(500)",
    "(502)",
    "(503)",
    "(504)",
    "timed out",
    "connection reset",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Quota,
    Transient,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quota => "quota",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

pub fn is_quota_message(message: &str) -> bool {
    QUOTA_SIGNATURES
        .iter()
        .any(|signature| message.contains(signature))
}

pub fn is_transient_message(message: &str) -> bool {
    TRANSIENT_SIGNATURES
        .iter()
        .any(|signature| message.contains(signature))
}

/// Quota wins over every other signal, then transient markers, then fatal.
pub fn classify_message(message: &str) -> ErrorKind {
    if is_quota_message(message) {
        return ErrorKind::Quota;
    }
    if is_transient_message(message) {
        return ErrorKind::Transient;
    }
    ErrorKind::Fatal
}
