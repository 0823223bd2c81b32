//! Recipient resolution: user labels, groups, and per-channel filtering.

use crate::directory::DirectorySnapshot;
use crate::model::{Channel, Event};
use std::collections::BTreeSet;

/// Labels that name a person through the event's `detail`.
pub const USER_LABELS: [&str; 5] = ["submitter", "author", "committer", "scm", "fixture-manager"];

const CHAT_SUFFIX: &str = "@chat";
const GROUP_SUFFIX: &str = "@group";
const INTERNAL_SUFFIX: &str = "@internal";

/// The label named by a token, for `<label>` or a bare known label.
pub fn label_of(token: &str) -> Option<&str> {
    if let Some(inner) = token.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
        return Some(inner.trim());
    }
    USER_LABELS.contains(&token).then_some(token)
}

/// Expand one recipient token into concrete addresses.
///
/// Labels read a comma-separated value from `event.detail`; a missing value
/// yields nothing. `<name>@group` expands to the group's members.
pub fn expand(token: &str, event: &Event, directory: &DirectorySnapshot) -> Vec<String> {
    let token = token.trim();
    if token.is_empty() {
        return Vec::new();
    }

    let addresses: Vec<String> = match label_of(token) {
        Some(label) => event
            .detail
            .get(label)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        None => vec![token.to_string()],
    };

    addresses
        .into_iter()
        .flat_map(|address| match address.strip_suffix(GROUP_SUFFIX) {
            Some(group) => directory.members(group).cloned().collect(),
            None => vec![address],
        })
        .collect()
}

/// Keep the addresses `channel` can deliver to.
pub fn filter_for(
    channel: Channel,
    addresses: &BTreeSet<String>,
    directory: &DirectorySnapshot,
) -> BTreeSet<String> {
    addresses
        .iter()
        .filter(|address| accepts(channel, address, directory))
        .cloned()
        .collect()
}

fn accepts(channel: Channel, address: &str, directory: &DirectorySnapshot) -> bool {
    let is_mailbox = address.contains('@')
        && !address.ends_with(CHAT_SUFFIX)
        && !address.ends_with(GROUP_SUFFIX)
        && !address.ends_with(INTERNAL_SUFFIX);
    let prefs = directory.preferences(address);

    match channel {
        Channel::Email => is_mailbox && prefs.is_none_or(|p| p.accepts(Channel::Email)),
        Channel::Slack => {
            address.ends_with(CHAT_SUFFIX)
                || (is_mailbox && prefs.is_some_and(|p| p.accepts(Channel::Slack)))
        }
        Channel::UiStore => prefs.is_some_and(|p| p.active),
        Channel::SupportArchive => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::UserRecord;

    fn directory() -> DirectorySnapshot {
        DirectorySnapshot::from_records([
            UserRecord::new("ann@example.com").in_group("ops"),
            UserRecord::new("bob@example.com")
                .in_group("ops")
                .opt_out(Channel::Email),
            UserRecord::new("cy@example.com").inactive(),
        ])
    }

    #[test]
    fn labels_are_bracketed_or_known() {
        assert_eq!(label_of("<owner>"), Some("owner"));
        assert_eq!(label_of("submitter"), Some("submitter"));
        assert_eq!(label_of("owner"), None);
    }

    #[test]
    fn email_filter_respects_preferences_and_suffixes() {
        let dir = directory();
        let all: BTreeSet<String> = [
            "ann@example.com",
            "bob@example.com",
            "cy@example.com",
            "ext@partner.io",
            "#ops@chat",
            "svc@internal",
            "nobody",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let email = filter_for(Channel::Email, &all, &dir);
        assert_eq!(
            email.into_iter().collect::<Vec<_>>(),
            vec!["ann@example.com", "ext@partner.io"]
        );

        let slack = filter_for(Channel::Slack, &all, &dir);
        assert_eq!(
            slack.into_iter().collect::<Vec<_>>(),
            vec!["#ops@chat", "ann@example.com", "bob@example.com"]
        );

        let ui = filter_for(Channel::UiStore, &all, &dir);
        assert_eq!(
            ui.into_iter().collect::<Vec<_>>(),
            vec!["ann@example.com", "bob@example.com"]
        );
    }
}
