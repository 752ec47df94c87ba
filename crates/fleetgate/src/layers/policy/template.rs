use super::registry::RegistryError;
use regex::Regex;
use std::collections::BTreeMap;

const HOST_PLACEHOLDER: &str = "host";
const DEFAULT_ARG_PATTERN: &str = "[A-Za-z0-9_./:-]+";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Host,
    Arg(String),
}

/// A registered command pattern such as `nvme smart-log {device}`.
///
/// `{host}` must equal the target host; other placeholders accept a single
/// shell-inert token, optionally narrowed by an argument rule. `{{` and `}}`
/// are literal braces.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    segments: Vec<Segment>,
    matcher: Regex,
    arg_rules: BTreeMap<String, Regex>,
}

impl CommandTemplate {
    pub fn parse(source: &str, arg_rules: &BTreeMap<String, String>) -> Result<Self, RegistryError> {
        let normalized = super::normalize_command(source);
        let segments = parse_segments(&normalized)?;

        let mut seen = Vec::new();
        let mut pattern = String::from("^");
        for segment in &segments {
            match segment {
                Segment::Literal(text) => pattern.push_str(&regex::escape(text)),
                Segment::Host => {
                    if seen.iter().any(|name| name == HOST_PLACEHOLDER) {
                        return Err(template_error(source, "duplicate {host} placeholder"));
                    }
                    seen.push(HOST_PLACEHOLDER.to_string());
                    pattern.push_str("(?P<host>\\S+)");
                }
                Segment::Arg(name) => {
                    if seen.iter().any(|existing| existing == name) {
                        return Err(template_error(source, &format!("duplicate placeholder {{{name}}}")));
                    }
                    seen.push(name.clone());
                    pattern.push_str(&format!("(?P<arg_{name}>{DEFAULT_ARG_PATTERN})"));
                }
            }
        }
        pattern.push('$');
        let matcher =
            Regex::new(&pattern).map_err(|err| template_error(source, &err.to_string()))?;

        let mut compiled_rules = BTreeMap::new();
        for (name, rule) in arg_rules {
            if !seen.iter().any(|existing| existing == name) {
                return Err(template_error(source, &format!("arg rule for unknown placeholder {name}")));
            }
            let regex = Regex::new(rule).map_err(|err| RegistryError::InvalidPattern {
                pattern: rule.clone(),
                message: err.to_string(),
            })?;
            compiled_rules.insert(name.clone(), regex);
        }

        Ok(Self {
            segments,
            matcher,
            arg_rules: compiled_rules,
        })
    }

    /// Escapes literal text so it parses back as a placeholder-free template.
    pub fn escape_literal(text: &str) -> String {
        text.replace('{', "{{").replace('}', "}}")
    }

    pub fn has_args(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, Segment::Arg(_)))
    }

    pub fn has_placeholders(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| !matches!(segment, Segment::Literal(_)))
    }

    /// Concrete command for `host`, available only when no argument is open.
    pub fn render(&self, host: &str) -> Option<String> {
        let mut rendered = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Host => rendered.push_str(host),
                Segment::Arg(_) => return None,
            }
        }
        Some(rendered)
    }

    /// Template text with placeholders left in place, used for denylist screening.
    pub fn skeleton(&self) -> String {
        let mut text = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => text.push_str(literal),
                Segment::Host => text.push_str("HOST"),
                Segment::Arg(name) => text.push_str(&name.to_uppercase()),
            }
        }
        text
    }

    pub fn matches(&self, command: &str, host: &str) -> bool {
        let Some(captures) = self.matcher.captures(command) else {
            return false;
        };
        if let Some(captured_host) = captures.name(HOST_PLACEHOLDER) {
            if captured_host.as_str() != host {
                return false;
            }
        }
        for (name, rule) in &self.arg_rules {
            let Some(value) = captures.name(&format!("arg_{name}")) else {
                return false;
            };
            if !full_match(rule, value.as_str()) {
                return false;
            }
        }
        true
    }
}

fn full_match(rule: &Regex, value: &str) -> bool {
    rule.find(value)
        .map(|found| found.start() == 0 && found.end() == value.len())
        .unwrap_or(false)
}

fn parse_segments(source: &str) -> Result<Vec<Segment>, RegistryError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = source.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                if !closed {
                    return Err(template_error(source, "unterminated placeholder"));
                }
                if !is_placeholder_name(&name) {
                    return Err(template_error(source, &format!("invalid placeholder name {name:?}")));
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                if name == HOST_PLACEHOLDER {
                    segments.push(Segment::Host);
                } else {
                    segments.push(Segment::Arg(name));
                }
            }
            '}' => return Err(template_error(source, "unbalanced '}'")),
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn is_placeholder_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
}

fn template_error(source: &str, message: &str) -> RegistryError {
    RegistryError::InvalidTemplate {
        template: source.to_string(),
        message: message.to_string(),
    }
}
