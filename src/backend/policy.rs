use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::BackendError;

/// Security-sensitive features this daemon knows how to enforce, paired
/// with whether local support is switched on. Policies the backend requires
/// but this table does not know cannot be honored.
const LOCAL_POLICIES: &[(&str, bool)] = &[
    ("record_sql", true),
    ("allow_raw_exception_messages", true),
    ("custom_events", true),
    ("custom_parameters", true),
];

/// One policy as offered by the backend menu.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PolicyOffer {
    pub enabled: bool,
    pub required: bool,
}

/// One policy as finally agreed between daemon and backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySetting {
    pub enabled: bool,
}

/// The backend's policy menu, keyed by policy name.
pub type PolicyMenu = BTreeMap<String, PolicyOffer>;

/// The agreed policy set sent with the connect payload.
pub type AgreedPolicies = BTreeMap<String, PolicySetting>;

fn local_support(name: &str) -> Option<bool> {
    LOCAL_POLICIES
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, supported)| *supported)
}

/// Validates the backend menu against local support and intersects the two
/// sides: a policy ends up enabled only when both sides want it (the more
/// conservative value wins).
///
/// Mismatches abort the handshake before any connect attempt: a required
/// policy this daemon cannot honor, or a locally supported policy absent
/// from the menu.
pub fn negotiate(menu: &PolicyMenu) -> Result<AgreedPolicies, BackendError> {
    let mut mismatched = Vec::new();

    for (name, offer) in menu {
        if offer.required && local_support(name) != Some(true) {
            mismatched.push(name.clone());
        }
    }

    for (name, supported) in LOCAL_POLICIES {
        if *supported && !menu.contains_key(*name) {
            mismatched.push((*name).to_string());
        }
    }

    if !mismatched.is_empty() {
        mismatched.sort();
        mismatched.dedup();
        return Err(BackendError::PolicyMismatch(mismatched));
    }

    let mut agreed = AgreedPolicies::new();
    for (name, supported) in LOCAL_POLICIES {
        if let Some(offer) = menu.get(*name) {
            agreed.insert(
                (*name).to_string(),
                PolicySetting {
                    enabled: offer.enabled && *supported,
                },
            );
        }
    }

    Ok(agreed)
}
