use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::enums::{DedupScope, OnlineStatus};

/// A group of monitored devices sharing one activation code.
/// Corresponds to the `groups` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Group {
    pub id: i32,
    pub user_id: i32,
    pub activation_code: String,
    pub account_limit: Option<i32>,
    pub is_active: bool,
    pub remark: String,
    pub category: String,
    /// `current` or `global`; anything else is treated as `current`.
    pub dedup_scope: String,
    /// Time-of-day at which the group's "today" counters reset, `HH:MM:SS`.
    pub reset_time: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Group {
    pub fn effective_dedup_scope(&self) -> DedupScope {
        DedupScope::effective(&self.dedup_scope)
    }
}

/// A monitored device owned by a group.
/// Corresponds to the `devices` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Device {
    pub id: i32,
    pub group_id: i32,
    pub activation_code: String,
    pub platform_type: String,
    /// External identifier reported by the agent, unique within the group.
    pub external_id: String,
    pub display_name: String,
    pub phone_number: String,
    pub profile_url: String,
    pub avatar_url: String,
    pub bio: String,
    pub status_message: String,
    pub online_status: OnlineStatus,
    /// Device-specific reset instant; when NULL the group's applies.
    pub reset_time: Option<String>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub last_online_at: Option<DateTime<Utc>>,
    pub first_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Rolling counters for one device, 1:1 with `devices`.
/// Corresponds to the `device_stats` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeviceStats {
    pub id: i32,
    pub device_id: i32,
    pub today_total: i32,
    pub total: i32,
    pub duplicate_total: i32,
    pub today_duplicate: i32,
    pub last_reset_date: Option<NaiveDate>,
    pub last_reset_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Rolling counters for one group, 1:1 with `groups`.
/// Corresponds to the `group_stats` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GroupStats {
    pub id: i32,
    pub group_id: i32,
    pub total_devices: i32,
    pub online_devices: i32,
    pub today_total: i32,
    pub total: i32,
    pub duplicate_total: i32,
    pub today_duplicate: i32,
    pub last_reset_date: Option<NaiveDate>,
    pub last_reset_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

