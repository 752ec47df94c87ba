use crate::config::GuardConfig;
use anyhow::Context;
use regex::Regex;
use std::collections::HashSet;

pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

const PROMPT_PATTERNS: &[&str] = &[
    r"^\[[^\]]+@[^\]]+\s[^\]]+\][#$]\s*$",
    r"^[\w.-]+@[^\s]+[:~\w/\-\.]+[#$]\s*$",
];

// A private key whose footer never arrived is redacted to the end of the text.
const REDACTIONS: &[(&str, &str)] = &[
    (
        r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----(?:.*?-----END [A-Z ]*PRIVATE KEY-----|.*)",
        "[REDACTED PRIVATE KEY]",
    ),
    (r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+", "Bearer [REDACTED]"),
    (
        r#"(?i)(\w*(?:password|passwd|secret|token|api_key|apikey|access_key|secret_key))(\s*[=:]\s*)("[^"]*"|'[^']*'|\S+)"#,
        "${1}${2}[REDACTED]",
    ),
    (r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b", "[REDACTED]"),
    (r"\bgh[pousr]_[A-Za-z0-9]{36,}\b", "[REDACTED]"),
];

const CHATTY_PHRASES: &[&str] = &[
    "i'm trying to",
    "i am trying to",
    "could you",
    "please",
    "help me",
    "i found",
    "in this context",
    "this could be",
    "let me",
    "you may",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedOutput {
    pub text: String,
    pub truncated: bool,
}

#[derive(Debug)]
pub struct OutputGuard {
    max_output_bytes: usize,
    min_summary_source_bytes: usize,
    min_overlap_ratio: f64,
    prompts: Vec<Regex>,
    redactions: Vec<(Regex, &'static str)>,
    token: Regex,
}

impl OutputGuard {
    pub fn new(config: &GuardConfig) -> anyhow::Result<Self> {
        let prompts = PROMPT_PATTERNS
            .iter()
            .map(|pattern| Regex::new(pattern).with_context(|| format!("prompt pattern {pattern}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let redactions = REDACTIONS
            .iter()
            .map(|(pattern, replacement)| {
                Regex::new(pattern)
                    .map(|regex| (regex, *replacement))
                    .with_context(|| format!("redaction pattern {pattern}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            max_output_bytes: config.max_output_bytes,
            min_summary_source_bytes: config.min_summary_source_bytes,
            min_overlap_ratio: config.min_overlap_ratio,
            prompts,
            redactions,
            token: Regex::new(r"[a-z0-9_-]{4,}").context("token pattern")?,
        })
    }

    /// Strips prompt echoes, redacts secrets, then caps the size.
    pub fn guard(&self, raw: &str) -> GuardedOutput {
        self.guard_captured(raw, false)
    }

    /// As [`guard`](Self::guard), also marking output the transport already cut short.
    pub fn guard_captured(&self, raw: &str, capture_truncated: bool) -> GuardedOutput {
        let stripped = self.strip_prompts(raw);
        let mut redacted = stripped;
        for (regex, replacement) in &self.redactions {
            if regex.is_match(&redacted) {
                redacted = regex.replace_all(&redacted, *replacement).into_owned();
            }
        }
        let (mut text, cut) = truncate_to(&redacted, self.max_output_bytes);
        if capture_truncated && !cut {
            text.push_str(TRUNCATION_MARKER);
        }
        GuardedOutput {
            text,
            truncated: cut || capture_truncated,
        }
    }

    /// Accepts `candidate` only if `raw` is substantial and the candidate's
    /// vocabulary is drawn from it.
    pub fn validate_summary(&self, raw: &str, candidate: &str) -> bool {
        if raw.trim().len() < self.min_summary_source_bytes {
            return false;
        }
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return false;
        }
        let lower = candidate.to_lowercase();
        if CHATTY_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
            return false;
        }
        let raw_tokens = self.tokens(raw);
        let summary_tokens = self.tokens(candidate);
        if raw_tokens.is_empty() || summary_tokens.is_empty() {
            return false;
        }
        let overlap = summary_tokens.intersection(&raw_tokens).count();
        overlap >= 1 && overlap as f64 / summary_tokens.len() as f64 >= self.min_overlap_ratio
    }

    fn tokens(&self, text: &str) -> HashSet<String> {
        let lower = text.to_lowercase();
        self.token
            .find_iter(&lower)
            .map(|found| found.as_str().to_string())
            .collect()
    }

    fn strip_prompts(&self, raw: &str) -> String {
        raw.lines()
            .filter(|line| {
                let trimmed = line.trim();
                !self.prompts.iter().any(|prompt| prompt.is_match(trimmed))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn truncate_to(text: &str, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text.to_string(), false);
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = String::with_capacity(cut + TRUNCATION_MARKER.len());
    truncated.push_str(&text[..cut]);
    truncated.push_str(TRUNCATION_MARKER);
    (truncated, true)
}
