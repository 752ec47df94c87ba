use super::denylist::Denylist;
use super::normalize_command;
use super::template::CommandTemplate;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("invalid template {template:?}: {message}")]
    InvalidTemplate { template: String, message: String },
    #[error("command name must not be empty")]
    EmptyName,
    #[error("command name already registered: {0}")]
    DuplicateName(String),
    #[error("alias {alias:?} on {name} conflicts with an existing name or alias")]
    DuplicateAlias { name: String, alias: String },
    #[error("aliases are not allowed on templated command {0}")]
    AliasOnTemplate(String),
    #[error("{subject} matches denied pattern {pattern}")]
    Denied { subject: String, pattern: String },
}

/// One registered command as it appears in the registry file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: String,
    #[serde(rename = "command")]
    pub literal_command_pattern: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub requires_privilege: bool,
    #[serde(default)]
    pub summary_default: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arg_rules: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryFile {
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub denylist: Vec<String>,
}

impl RegistryFile {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read registry {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse registry {}", path.display()))
    }
}

#[derive(Debug)]
pub struct RegisteredCommand {
    pub spec: CommandSpec,
    pub template: CommandTemplate,
}

/// An immutable, validated view of the command registry.
///
/// Every registered literal and template has been screened against the
/// denylist, so a command that resolves through the registry is never also
/// denied.
#[derive(Debug)]
pub struct Registry {
    file: RegistryFile,
    extra_denied: Vec<String>,
    commands: Vec<RegisteredCommand>,
    by_key: HashMap<String, usize>,
    allowlist: HashSet<String>,
    denylist: Denylist,
    version: u64,
}

impl Registry {
    /// Validates `file` against the built-in denylist, the file's own
    /// denylist and `extra_denied`.
    pub fn build(file: RegistryFile, extra_denied: &[String]) -> Result<Self, RegistryError> {
        Self::build_version(file, extra_denied.to_vec(), 1)
    }

    fn build_version(
        file: RegistryFile,
        extra_denied: Vec<String>,
        version: u64,
    ) -> Result<Self, RegistryError> {
        let denied: Vec<&str> = extra_denied
            .iter()
            .chain(file.denylist.iter())
            .map(String::as_str)
            .collect();
        let denylist = Denylist::new(&denied)?;

        let mut commands = Vec::with_capacity(file.commands.len());
        let mut by_key = HashMap::new();
        for spec in &file.commands {
            let name = spec.name.trim().to_lowercase();
            if name.is_empty() {
                return Err(RegistryError::EmptyName);
            }
            let template = CommandTemplate::parse(&spec.literal_command_pattern, &spec.arg_rules)?;
            if let Some(pattern) = denylist.check(&template.skeleton()) {
                return Err(RegistryError::Denied {
                    subject: format!("command {}", spec.name),
                    pattern: pattern.to_string(),
                });
            }
            if !spec.aliases.is_empty() && template.has_args() {
                return Err(RegistryError::AliasOnTemplate(spec.name.clone()));
            }

            let index = commands.len();
            if by_key.insert(name.clone(), index).is_some() {
                return Err(RegistryError::DuplicateName(spec.name.clone()));
            }
            for alias in &spec.aliases {
                let key = normalize_command(alias).to_lowercase();
                if key.is_empty() {
                    continue;
                }
                if by_key.insert(key, index).is_some() {
                    return Err(RegistryError::DuplicateAlias {
                        name: spec.name.clone(),
                        alias: alias.clone(),
                    });
                }
            }
            commands.push(RegisteredCommand {
                spec: spec.clone(),
                template,
            });
        }

        let mut allowlist = HashSet::with_capacity(file.allowlist.len());
        for literal in &file.allowlist {
            let literal = normalize_command(literal);
            if literal.is_empty() {
                continue;
            }
            if let Some(pattern) = denylist.check(&literal) {
                return Err(RegistryError::Denied {
                    subject: format!("allowlisted literal {literal:?}"),
                    pattern: pattern.to_string(),
                });
            }
            allowlist.insert(literal);
        }

        Ok(Self {
            file,
            extra_denied,
            commands,
            by_key,
            allowlist,
            denylist,
            version,
        })
    }

    /// Builds the next version with `spec` added and its literal allowlisted.
    pub fn with_command(&self, spec: CommandSpec, literal: &str) -> Result<Self, RegistryError> {
        let mut file = self.file.clone();
        file.commands.push(spec);
        let literal = normalize_command(literal);
        if !file.allowlist.iter().any(|existing| normalize_command(existing) == literal) {
            file.allowlist.push(literal);
        }
        Self::build_version(file, self.extra_denied.clone(), self.version + 1)
    }

    pub fn file(&self) -> &RegistryFile {
        &self.file
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn denied_by(&self, command: &str) -> Option<&str> {
        self.denylist.check(command)
    }

    pub fn is_allowlisted(&self, command: &str) -> bool {
        self.allowlist.contains(command)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_key.contains_key(&name.trim().to_lowercase())
    }

    /// Command whose template renders to exactly `command` for `host`.
    pub fn find_literal(&self, command: &str, host: &str) -> Option<&RegisteredCommand> {
        self.commands
            .iter()
            .find(|entry| entry.template.render(host).as_deref() == Some(command))
    }

    /// Case-insensitive lookup by name or alias.
    pub fn find_alias(&self, text: &str) -> Option<&RegisteredCommand> {
        self.by_key
            .get(&text.to_lowercase())
            .and_then(|index| self.commands.get(*index))
    }

    pub fn find_template(&self, command: &str, host: &str) -> Option<&RegisteredCommand> {
        self.commands
            .iter()
            .filter(|entry| entry.template.has_placeholders())
            .find(|entry| entry.template.matches(command, host))
    }
}

/// The live registry: readers take a whole snapshot, writers publish a new one.
#[derive(Debug)]
pub struct SharedRegistry {
    current: RwLock<Arc<Registry>>,
    writer: Mutex<()>,
}

impl SharedRegistry {
    pub fn new(registry: Registry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
            writer: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<Registry> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&current)
    }

    /// Serializes writers; `build` sees the latest snapshot and its result is
    /// published only if it succeeds.
    pub fn update<E>(
        &self,
        build: impl FnOnce(&Registry) -> Result<Registry, E>,
    ) -> Result<Arc<Registry>, E> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let base = self.snapshot();
        let next = Arc::new(build(&base)?);
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = Arc::clone(&next);
        Ok(next)
    }
}
