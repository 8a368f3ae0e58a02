use serde::Deserialize;
use std::collections::HashSet;
use teloxide::types::UserId;

#[derive(Deserialize, Clone)]
pub(crate) struct Config {
    pub(crate) token: String,

    /// IDs of the users who may run the admin commands. Comma-separated in
    /// the env var. Admin access is tied to these ids only, never to chat
    /// ownership or usernames.
    #[serde(default)]
    pub(crate) admins: Vec<UserId>,
}

/// Decides who is allowed to run admin commands. Kept separate from the raw
/// config so the command handlers can be tested with an arbitrary policy.
#[derive(Clone)]
pub(crate) struct AdminPolicy {
    admins: HashSet<UserId>,
}

impl AdminPolicy {
    pub(crate) fn new(admins: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }

    pub(crate) fn is_admin(&self, user_id: UserId) -> bool {
        self.admins.contains(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configured_ids_are_admins() {
        let policy = AdminPolicy::new([UserId(1), UserId(7)]);

        assert!(policy.is_admin(UserId(1)));
        assert!(policy.is_admin(UserId(7)));
        assert!(!policy.is_admin(UserId(2)));

        let empty = AdminPolicy::new([]);
        assert!(!empty.is_admin(UserId(1)));
    }
}
