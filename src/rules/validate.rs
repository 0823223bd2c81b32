//! Rule draft validation against the vocabularies and the codes registry.

use crate::codes::CodeRegistry;
use crate::error::{Error, Result};
use crate::model::{Channel, RuleDraft, RuleSpec, Severity};

/// Validate a client-submitted rule, naming the first offending field.
pub fn validate_draft(draft: RuleDraft, registry: &CodeRegistry) -> Result<RuleSpec> {
    if draft.channels.is_empty() {
        return Err(Error::validation("channels", "Must specify at least one channel"));
    }
    let channels = draft
        .channels
        .iter()
        .map(|c| {
            c.parse::<Channel>().map_err(|_| {
                Error::validation("channels", format!("Invalid channel supplied ({c})"))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if draft.severities.is_empty() {
        return Err(Error::validation("severities", "Must specify at least one severity"));
    }
    let severities = draft
        .severities
        .iter()
        .map(|s| {
            s.parse::<Severity>().map_err(|_| {
                Error::validation("severities", format!("Invalid severity supplied ({s})"))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if draft.recipients.is_empty() {
        return Err(Error::validation("recipients", "Must specify at least one recipient"));
    }
    if let Some(blank) = draft.recipients.iter().find(|r| r.trim().is_empty()) {
        return Err(Error::validation(
            "recipients",
            format!("Invalid recipient supplied ({blank})"),
        ));
    }

    if let Some(code) = draft.codes.iter().find(|c| !registry.resolves(c)) {
        return Err(Error::validation("codes", format!("Invalid code supplied ({code})")));
    }

    Ok(RuleSpec {
        name: draft.name,
        enabled: draft.enabled,
        codes: draft.codes,
        severities,
        channels,
        recipients: draft.recipients,
    })
}
