use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::PgPool;
use tracing::info;

use crate::db::models::Group;
use crate::db::services::{contact_service, device_service, event_service, stats_service};
use crate::ingest::dedup;
use crate::web::AppError;
use crate::ws::models::IncomingPayload;

/// Ingests one incoming-contact event. The duplicate verdict, the event row,
/// both counter bumps and the first-seen directory entry commit as one
/// transaction; a failure anywhere leaves no partial trace.
///
/// Returns the duplicate verdict for the reply frame. Broadcasting happens
/// at the caller, after the commit.
pub async fn process(
    pool: &PgPool,
    group: &Group,
    payload: &IncomingPayload,
) -> Result<bool, AppError> {
    let device = device_service::get_device_by_external_id(
        pool,
        group.id,
        &payload.device_external_id,
    )
    .await?
    .ok_or_else(|| {
        AppError::NotFound(format!("device not found: {}", payload.device_external_id))
    })?;

    let occurred_at = parse_event_timestamp(payload.timestamp.as_deref());

    let mut tx = pool.begin().await?;

    let verdict = dedup::evaluate(&mut tx, group, &payload.contact_external_id).await?;

    event_service::insert_incoming_event(
        &mut *tx,
        &event_service::NewIncomingEvent {
            device_id: device.id,
            group_id: group.id,
            contact_external_id: payload.contact_external_id.clone(),
            occurred_at,
            display_name: payload.display_name.clone().unwrap_or_default(),
            avatar_url: payload.avatar_url.clone().unwrap_or_default(),
            phone_number: payload.phone_number.clone().unwrap_or_default(),
            is_duplicate: verdict.is_duplicate,
            dedup_scope: verdict.scope.as_str().to_string(),
            raw_data: serde_json::to_value(payload).ok(),
        },
    )
    .await?;

    stats_service::ensure_device_stats(&mut *tx, device.id).await?;
    stats_service::bump_device_stats(&mut *tx, device.id, verdict.is_duplicate).await?;
    stats_service::ensure_group_stats(&mut *tx, group.id).await?;
    stats_service::bump_group_stats(&mut *tx, group.id, verdict.is_duplicate).await?;

    let already_in_directory = if verdict.is_duplicate {
        true
    } else {
        dedup::seen_in_directory(
            &mut *tx,
            &payload.contact_external_id,
            &device.platform_type,
        )
        .await?
    };
    if !already_in_directory {
        contact_service::insert_first_seen_contact(
            &mut *tx,
            &contact_service::NewContactEntry {
                group_id: group.id,
                activation_code: group.activation_code.clone(),
                device_id: Some(device.id),
                platform_type: device.platform_type.clone(),
                external_id: payload.contact_external_id.clone(),
                display_name: payload.display_name.clone().unwrap_or_default(),
                phone_number: payload.phone_number.clone().unwrap_or_default(),
                avatar_url: payload.avatar_url.clone().unwrap_or_default(),
                dedup_scope: verdict.scope.as_str().to_string(),
                first_seen_at: occurred_at,
            },
        )
        .await?;
    }

    tx.commit().await?;

    info!(
        group_id = group.id,
        device_id = device.id,
        contact = %payload.contact_external_id,
        is_duplicate = verdict.is_duplicate,
        scope = verdict.scope.as_str(),
        "incoming event ingested"
    );

    Ok(verdict.is_duplicate)
}

/// Agents report event times as RFC 3339 or `YYYY-MM-DD HH:MM:SS` (UTC).
/// Anything unparseable falls back to the arrival time.
fn parse_event_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return Utc::now();
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.with_timezone(&Utc);
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return parsed.and_utc();
    }
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_rfc3339_timestamps() {
        let parsed = parse_event_timestamp(Some("2026-08-20T10:30:00+08:00"));
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 8, 20, 2, 30, 0).unwrap());
    }

    #[test]
    fn parses_plain_datetime_as_utc() {
        let parsed = parse_event_timestamp(Some("2026-08-20 10:30:00"));
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 8, 20, 10, 30, 0).unwrap());
    }

    #[test]
    fn garbage_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let parsed = parse_event_timestamp(Some("yesterday-ish"));
        assert!(parsed >= before && parsed <= Utc::now());
    }

    #[test]
    fn missing_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let parsed = parse_event_timestamp(None);
        assert!(parsed >= before && parsed <= Utc::now());
    }
}
