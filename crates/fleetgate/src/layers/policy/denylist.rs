use super::registry::RegistryError;
use regex::{Regex, RegexBuilder};

/// Destructive or irreversible operations that can never be run, approved, or
/// registered.
pub const BUILTIN_DENIED_PATTERNS: &[&str] = &[
    r"\brm\s+(\S+\s+)*-[A-Za-z]*[rRfF]",
    r"\brm\s+(\S+\s+)*--(recursive|force|no-preserve-root)\b",
    r"\bfind\b.*\s-delete\b",
    r"\bxargs\b.*\brm\b",
    r"\bmkfs(\.\w+)?\b",
    r"\bdd\b.*\b(if|of)=",
    r"\b(shred|wipe|wipefs|blkdiscard)\b",
    r"\b(fdisk|sfdisk|cfdisk|gdisk|sgdisk|parted)\b",
    r"\bnvme\s+(format|sanitize|write-zeroes|security-erase|ns-delete|delete-ns|detach-ns|fw-download|fw-commit|fw-activate)\b",
    r"\bhdparm\b.*--(security-erase|security-erase-enhanced|security-set-pass|dco-restore)",
    r"\bsg_(format|sanitize)\b",
    r"\b(lvremove|vgremove|pvremove)\b",
    r"\bmdadm\b.*--(zero-superblock|remove|fail)\b",
    r"\bsystemctl\s+(stop|disable|mask|kill|restart|isolate|poweroff|reboot|halt)\b",
    r"\bservice\s+\S+\s+(stop|restart)\b",
    r"(^|[;&|]\s*|\bsudo\s+(-\S+\s+)*)(shutdown|reboot|halt|poweroff)\b",
    r"\binit\s+[06]\b",
    r">\s*/dev/(sd[a-z]|nvme\d|hd[a-z]|vd[a-z]|xvd[a-z])",
    r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
    r"\bchmod\s+(-\S+\s+)*[0-7]{3,4}\s+/(\s|$)",
    r"\bchown\s+(-\S+\s+)*\S+\s+/(\s|$)",
];

#[derive(Debug, Clone)]
pub struct Denylist {
    rules: Vec<(String, Regex)>,
}

impl Denylist {
    /// Compiles the built-in patterns plus `extra`, all case-insensitive.
    pub fn new<S: AsRef<str>>(extra: &[S]) -> Result<Self, RegistryError> {
        let mut rules = Vec::with_capacity(BUILTIN_DENIED_PATTERNS.len() + extra.len());
        let patterns = BUILTIN_DENIED_PATTERNS
            .iter()
            .copied()
            .chain(extra.iter().map(AsRef::as_ref));
        for pattern in patterns {
            if rules.iter().any(|(existing, _)| existing == pattern) {
                continue;
            }
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|err| RegistryError::InvalidPattern {
                    pattern: pattern.to_string(),
                    message: err.to_string(),
                })?;
            rules.push((pattern.to_string(), regex));
        }
        Ok(Self { rules })
    }

    /// Returns the first pattern `command` matches.
    pub fn check(&self, command: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(_, regex)| regex.is_match(command))
            .map(|(pattern, _)| pattern.as_str())
    }
}
