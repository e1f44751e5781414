//! Hotword normalization.
//!
//! The host hands over a raw multi-line string, one vocabulary term per
//! line, optionally followed by a numeric weight (`"肉眼所见 20"`). The
//! engine derives an ordered, deduplicated term list from it; the backend's
//! own biasing mechanism consumes the normalized form.

use serde::Serialize;

use crate::inference::BackendKind;

/// Neutral placeholder fed to backends that require a non-empty hotword
/// string when the host configured none.
pub const HOTWORD_PLACEHOLDER: &str = "。";

const PREVIEW_LIMIT: usize = 20;

/// Extracts unique hotwords, insertion order preserved, case-sensitive.
///
/// Per line: when the second token is a numeric weight, only the first
/// token is a term; otherwise every token on the line is. If line-wise
/// extraction yields nothing, the whole string is retried as one
/// whitespace-delimited list.
pub fn extract_hotwords(raw: &str) -> Vec<String> {
    let mut words: Vec<String> = Vec::new();

    for line in raw.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }

        let terms: &[&str] = if tokens.len() >= 2 && is_weight_token(tokens[1]) {
            &tokens[..1]
        } else {
            &tokens
        };

        for term in terms {
            if !term.is_empty() && !words.iter().any(|w| w == term) {
                words.push((*term).to_string());
            }
        }
    }

    if words.is_empty() {
        for term in raw.split_whitespace() {
            if !words.iter().any(|w| w == term) {
                words.push(term.to_string());
            }
        }
    }

    words
}

fn is_weight_token(token: &str) -> bool {
    let digits = token.replacen('.', "", 1);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// Space-joined hotword string for backends that take one; never empty
/// (falls back to [`HOTWORD_PLACEHOLDER`]).
pub fn normalize_hotwords(raw: &str) -> String {
    let words = extract_hotwords(raw);
    if words.is_empty() {
        return HOTWORD_PLACEHOLDER.to_string();
    }
    words.join(" ")
}

/// Hotword acceptance summary returned in the `init` success payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HotwordStats {
    pub backend: String,
    pub configured_count: usize,
    pub configured_preview: Vec<String>,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_preview: Option<Vec<String>>,
}

/// Builds the diagnostics the host sees after `init`. Only hotword-aware
/// backends get the normalized-form fields.
pub fn inspect_hotwords(backend: BackendKind, raw: &str) -> HotwordStats {
    let configured = extract_hotwords(raw);
    let mut stats = HotwordStats {
        backend: backend.as_str().to_string(),
        configured_count: configured.len(),
        configured_preview: configured.iter().take(PREVIEW_LIMIT).cloned().collect(),
        mode: "backend-pass-through".to_string(),
        normalized_count: None,
        normalized_preview: None,
    };

    if backend.wants_hotwords() {
        let normalized: Vec<String> = normalize_hotwords(raw)
            .split(' ')
            .filter(|w| !w.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        stats.mode = "normalized".to_string();
        stats.normalized_count = Some(normalized.len());
        stats.normalized_preview = Some(normalized.into_iter().take(PREVIEW_LIMIT).collect());
    }

    stats
}
