use verdant_contracts::errors::{classify_message, is_quota_message, ErrorKind};

use crate::backend::{truncate_text, UpstreamStatusError};

/// Buckets a backend failure. Quota markers win, then transport failures
/// reported by the HTTP client, then upstream message markers.
///
/// HTTP status failures carry a kind decided from their untruncated body.
/// Anything else falls back to substring sniffing over the error text.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    let status_kind = upstream_status_kind(err);
    let text = error_chain_text(err, 2048);
    if status_kind == Some(ErrorKind::Quota) || is_quota_message(&text) {
        return ErrorKind::Quota;
    }
    if status_kind == Some(ErrorKind::Transient) || is_transport_error(err) {
        return ErrorKind::Transient;
    }
    classify_message(&text)
}

fn upstream_status_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<UpstreamStatusError>())
        .map(|status| status.kind)
}

pub fn is_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

/// Every distinct message in the chain, outermost first.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Context};
    use verdant_contracts::errors::ErrorKind;

    use super::{classify, error_chain_text};
    use crate::backend::UpstreamStatusError;

    #[test]
    fn quota_text_anywhere_in_the_chain_is_quota() {
        let err = Err::<(), _>(anyhow!("Gemini request failed (429): RESOURCE_EXHAUSTED"))
            .context("identify failed")
            .unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Quota);
    }

    #[test]
    fn upstream_outage_is_transient() {
        let err = anyhow!("Gemini request failed (503): The model is overloaded. UNAVAILABLE");
        assert_eq!(classify(&err), ErrorKind::Transient);
    }

    #[test]
    fn unmatched_failures_are_fatal() {
        let err = anyhow!("Gemini request failed (400): API key not valid");
        assert_eq!(classify(&err), ErrorKind::Fatal);
    }

    #[test]
    fn quota_marker_past_the_display_cut_is_still_quota() {
        let body = format!(
            "{{\"error\":{{\"message\":\"{}\",\"status\":\"RESOURCE_EXHAUSTED\"}}}}",
            "x".repeat(900)
        );
        let status = UpstreamStatusError::from_body(400, &body);
        assert!(!status.to_string().contains("RESOURCE_EXHAUSTED"));
        let err = Err::<(), _>(anyhow::Error::new(status))
            .context("assess failed")
            .unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Quota);
    }

    #[test]
    fn too_many_requests_is_quota_whatever_the_body() {
        let err = anyhow::Error::new(UpstreamStatusError::from_body(429, "slow down"));
        assert_eq!(classify(&err), ErrorKind::Quota);
    }

    #[test]
    fn chain_text_skips_repeated_messages() {
        let err = Err::<(), _>(anyhow!("inner"))
            .context("inner")
            .context("outer")
            .unwrap_err();
        assert_eq!(error_chain_text(&err, 200), "outer | caused by: inner");
    }
}
