use super::{is_valid_host, normalize_command};
use super::registry::{RegisteredCommand, SharedRegistry};
use protocol::PrivilegeMode;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allowed,
    NeedsApproval,
    Rejected,
}

impl AuthDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::NeedsApproval => "needs_approval",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Authorization {
    pub decision: AuthDecision,
    /// Whitespace-normalized request text.
    pub requested: String,
    /// Literal that would be sent to the host.
    pub final_command: String,
    pub privilege: PrivilegeMode,
    pub command_name: Option<String>,
    pub requires_privilege: bool,
    pub summary_default: bool,
    pub reason: String,
    pub registry_version: u64,
}

impl Authorization {
    fn new(decision: AuthDecision, requested: &str, reason: impl Into<String>, version: u64) -> Self {
        Self {
            decision,
            requested: requested.to_string(),
            final_command: requested.to_string(),
            privilege: PrivilegeMode::Unprivileged,
            command_name: None,
            requires_privilege: false,
            summary_default: false,
            reason: reason.into(),
            registry_version: version,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == AuthDecision::Allowed
    }
}

/// Maps free-form request text onto the registry.
///
/// Resolution order: denylist, then exact registered literal, allowlisted
/// literal, name or alias, and finally argument templates. Anything left over
/// needs operator approval.
pub struct CommandAuthorizer {
    registry: Arc<SharedRegistry>,
    escalation_prefix: String,
}

impl CommandAuthorizer {
    pub fn new(registry: Arc<SharedRegistry>, escalation_prefix: impl Into<String>) -> Self {
        Self {
            registry,
            escalation_prefix: normalize_command(&escalation_prefix.into()),
        }
    }

    pub fn authorize(&self, requested_text: &str, host: &str) -> Authorization {
        let registry = self.registry.snapshot();
        let version = registry.version();
        let requested = normalize_command(requested_text);
        if requested.is_empty() {
            return Authorization::new(AuthDecision::Rejected, &requested, "empty command", version);
        }
        if !is_valid_host(host) {
            return Authorization::new(AuthDecision::Rejected, &requested, "invalid target host", version);
        }
        if let Some(pattern) = registry.denied_by(&requested) {
            return Authorization::new(
                AuthDecision::Rejected,
                &requested,
                format!("denied by pattern {pattern}"),
                version,
            );
        }

        if let Some(entry) = registry.find_literal(&requested, host) {
            return self.allowed(&requested, requested.clone(), Some(entry), "registered literal", version);
        }
        if registry.is_allowlisted(&requested) {
            return self.allowed(&requested, requested.clone(), None, "allowlisted literal", version);
        }
        if let Some(entry) = registry.find_alias(&requested) {
            if let Some(rendered) = entry.template.render(host) {
                if let Some(pattern) = registry.denied_by(&rendered) {
                    return Authorization::new(
                        AuthDecision::Rejected,
                        &requested,
                        format!("rendered command denied by pattern {pattern}"),
                        version,
                    );
                }
                return self.allowed(&requested, rendered, Some(entry), "registered alias", version);
            }
        }
        if let Some(entry) = registry.find_template(&requested, host) {
            return self.allowed(&requested, requested.clone(), Some(entry), "registered template", version);
        }

        Authorization::new(
            AuthDecision::NeedsApproval,
            &requested,
            "command is not registered",
            version,
        )
    }

    /// Escalated literal for a command that needs privilege, if the registry
    /// allowlists exactly that literal.
    pub fn escalate(&self, authorization: &Authorization) -> Result<String, String> {
        if !authorization.requires_privilege {
            return Err(format!(
                "{} is not registered as requiring privilege",
                authorization.final_command
            ));
        }
        let escalated = self.escalated_form(&authorization.final_command);
        let registry = self.registry.snapshot();
        if registry.is_allowlisted(&escalated) {
            Ok(escalated)
        } else {
            Err(format!("escalated form is not allowlisted: {escalated}"))
        }
    }

    fn escalated_form(&self, command: &str) -> String {
        if self.escalation_prefix.is_empty() {
            command.to_string()
        } else {
            format!("{} {}", self.escalation_prefix, command)
        }
    }

    fn privilege_of(&self, command: &str) -> PrivilegeMode {
        let prefix = &self.escalation_prefix;
        if !prefix.is_empty()
            && command.starts_with(prefix.as_str())
            && command[prefix.len()..].starts_with(' ')
        {
            PrivilegeMode::Escalated
        } else {
            PrivilegeMode::Unprivileged
        }
    }

    fn allowed(
        &self,
        requested: &str,
        final_command: String,
        entry: Option<&RegisteredCommand>,
        reason: &str,
        version: u64,
    ) -> Authorization {
        let mut authorization = Authorization::new(AuthDecision::Allowed, requested, reason, version);
        authorization.privilege = self.privilege_of(&final_command);
        authorization.final_command = final_command;
        if let Some(entry) = entry {
            authorization.command_name = Some(entry.spec.name.clone());
            authorization.requires_privilege = entry.spec.requires_privilege;
            authorization.summary_default = entry.spec.summary_default;
        }
        authorization
    }
}
