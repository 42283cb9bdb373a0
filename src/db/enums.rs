use serde::{Deserialize, Serialize};

/// Business-level online status of a monitored device.
///
/// `AbnormalOffline` is only ever assigned by the offline-reconciliation pass;
/// agents report the other three through `account_status_change` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OnlineStatus {
    Online,
    Offline,
    UserLogout,
    AbnormalOffline,
}

impl OnlineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnlineStatus::Online => "online",
            OnlineStatus::Offline => "offline",
            OnlineStatus::UserLogout => "user_logout",
            OnlineStatus::AbnormalOffline => "abnormal_offline",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "online" => Some(OnlineStatus::Online),
            "offline" => Some(OnlineStatus::Offline),
            "user_logout" => Some(OnlineStatus::UserLogout),
            "abnormal_offline" => Some(OnlineStatus::AbnormalOffline),
            _ => None,
        }
    }
}

/// Scope for duplicate-contact detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DedupScope {
    Current,
    Global,
}

impl DedupScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupScope::Current => "current",
            DedupScope::Global => "global",
        }
    }

    /// Resolves the scope a group has configured. Anything that is not
    /// explicitly `global` (including empty or unknown values) means
    /// group-local dedup.
    pub fn effective(raw: &str) -> Self {
        if raw == "global" {
            DedupScope::Global
        } else {
            DedupScope::Current
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_scope_defaults_to_current() {
        assert_eq!(DedupScope::effective(""), DedupScope::Current);
        assert_eq!(DedupScope::effective("current"), DedupScope::Current);
        assert_eq!(DedupScope::effective("nonsense"), DedupScope::Current);
        assert_eq!(DedupScope::effective("global"), DedupScope::Global);
    }

    #[test]
    fn online_status_round_trips() {
        for status in [
            OnlineStatus::Online,
            OnlineStatus::Offline,
            OnlineStatus::UserLogout,
            OnlineStatus::AbnormalOffline,
        ] {
            assert_eq!(OnlineStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OnlineStatus::parse("sleeping"), None);
    }
}
