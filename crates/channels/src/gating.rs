use serde::{Deserialize, Serialize};

/// Check if an identifier passes an allowlist.
///
/// An empty allowlist means everyone is allowed (open policy).
/// Entries are matched case-insensitively and support `*` wildcards.
pub fn is_allowed(id: &str, allowlist: &[String]) -> bool {
    allowlist.is_empty() || matches_any(id, allowlist)
}

/// Like [`is_allowed`], but an empty list matches nothing. Used for
/// blocklists.
pub fn matches_any(id: &str, patterns: &[String]) -> bool {
    let id = id.to_lowercase();
    patterns
        .iter()
        .any(|pattern| glob_match(&pattern.to_lowercase(), &id))
}

/// Glob matching where `*` stands for any (possibly empty) sequence.
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(head) = parts.next() else {
        return text.is_empty();
    };
    let Some(mut rest) = text.strip_prefix(head) else {
        return false;
    };

    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        // No wildcard at all.
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// Mention activation mode for group chats.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MentionMode {
    /// The bot must be @mentioned, or the text must carry a group prefix or keyword.
    #[default]
    Mention,
    /// The bot responds to every group message.
    Always,
    /// The bot does not respond in groups.
    None,
}

/// Direct-message access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Anyone can message the bot.
    #[default]
    Open,
    /// Only senders on the allowlist.
    Allowlist,
    /// Direct messages disabled.
    Disabled,
}

impl DmPolicy {
    pub fn admits(self, sender_id: &str, allowlist: &[String]) -> bool {
        match self {
            Self::Open => true,
            Self::Allowlist => !allowlist.is_empty() && matches_any(sender_id, allowlist),
            Self::Disabled => false,
        }
    }
}

/// Group access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// The bot responds in all groups.
    #[default]
    Open,
    /// Only in groups on the allowlist.
    Allowlist,
    /// Groups disabled.
    Disabled,
}

impl GroupPolicy {
    /// A group passes if either its id or its display name is allowlisted.
    pub fn admits(self, group_id: &str, group_name: Option<&str>, allowlist: &[String]) -> bool {
        match self {
            Self::Open => true,
            Self::Allowlist => {
                !allowlist.is_empty()
                    && (matches_any(group_id, allowlist)
                        || group_name.is_some_and(|name| matches_any(name, allowlist)))
            },
            Self::Disabled => false,
        }
    }
}
