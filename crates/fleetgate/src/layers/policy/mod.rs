pub mod authorizer;
pub mod denylist;
pub mod registry;
pub mod store;
pub mod template;

pub use authorizer::{AuthDecision, Authorization, CommandAuthorizer};
pub use registry::{CommandSpec, Registry, RegistryError, RegistryFile, SharedRegistry};
pub use store::{EphemeralStore, JsonFileStore, RegistryStore};

/// Trims and collapses runs of whitespace to single spaces.
pub fn normalize_command(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Longest DNS name; IP literals are shorter.
const MAX_HOST_LEN: usize = 253;

/// A host is a plain hostname, IPv4 or IPv6 literal: it starts with an ASCII
/// alphanumeric and contains only alphanumerics, `.`, `_`, `:` and `-`.
pub fn is_valid_host(host: &str) -> bool {
    let mut chars = host.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    host.len() <= MAX_HOST_LEN
        && first.is_ascii_alphanumeric()
        && chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | ':' | '-'))
}
