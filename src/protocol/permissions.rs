//! Capability permission filter.
//!
//! A pure function of `(capability name, trust context)`. Local sessions may call anything;
//! remote sessions only what is on [`REMOTE_ALLOW_LIST`]. Names are matched exactly, so
//! unknown names, case variants and near-misses are all denied.

use serde::Serialize;

/// Capabilities a remote (network) session may see and call.
pub const REMOTE_ALLOW_LIST: &[&str] = &[
    "memory_store",
    "memory_get",
    "memory_list",
    "memory_recall",
    "memory_search",
    "memory_delete",
    "memory_feedback",
    "memory_relate",
    "memory_related",
    "graph_add_node",
    "graph_add_edge",
    "graph_related",
    "interaction_record",
    "pattern_analyze",
    "web_search",
    "fetch_page",
    "get_transcript",
];

/// Trust level of the transport a session arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustContext {
    /// The stdio channel of the local process.
    Local,
    /// Anything arriving over the network.
    Remote,
}

impl TrustContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

pub fn classify(name: &str, trust: TrustContext) -> Decision {
    match trust {
        TrustContext::Local => Decision::Allow,
        TrustContext::Remote if REMOTE_ALLOW_LIST.contains(&name) => Decision::Allow,
        TrustContext::Remote => Decision::Deny,
    }
}

pub fn is_remote_allowed(name: &str) -> bool {
    classify(name, TrustContext::Remote) == Decision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_allows_everything() {
        for name in ["memory_export", "shell_exec", "", "anything at all"] {
            assert_eq!(classify(name, TrustContext::Local), Decision::Allow);
        }
    }

    #[test]
    fn remote_allows_only_listed_names() {
        for name in REMOTE_ALLOW_LIST {
            assert_eq!(classify(name, TrustContext::Remote), Decision::Allow);
        }
        for name in ["memory_export", "memory_import", "memory_cleanup", "shell_exec"] {
            assert_eq!(classify(name, TrustContext::Remote), Decision::Deny);
        }
    }

    #[test]
    fn remote_matching_is_exact() {
        for name in [
            "Memory_Store",
            "MEMORY_STORE",
            "memory_store ",
            " memory_store",
            "memory_store\0",
            "memory_stor",
            "memory_storee",
            "web_search/../memory_export",
        ] {
            assert_eq!(classify(name, TrustContext::Remote), Decision::Deny, "{name:?}");
        }
    }

    #[test]
    fn fuzzed_names_fail_closed() {
        // Deterministic pseudo-random names; none may be allowed unless exactly listed.
        let alphabet: Vec<char> = "abcdefghijklmnopqrstuvwxyz_/. -ÄΩ0123456789".chars().collect();
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        for _ in 0..5_000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let len = (state % 24) as usize;
            let name: String = (0..len)
                .map(|i| alphabet[((state >> (i % 8 * 8)) as usize + i) % alphabet.len()])
                .collect();
            let expected = if REMOTE_ALLOW_LIST.contains(&name.as_str()) {
                Decision::Allow
            } else {
                Decision::Deny
            };
            assert_eq!(classify(&name, TrustContext::Remote), expected, "{name:?}");
        }
    }
}
