//! Sheet date parsing and the scheduled-event decision.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;

/// Accepted date-time layouts, tried in order.
pub const DATE_TIME_FORMATS: [&str; 2] = ["%m/%d/%Y %I:%M:%S %p", "%Y-%m-%d %I:%M:%S %p"];

/// Date-only layouts (links sheet windows).
pub const DATE_FORMATS: [&str; 2] = ["%m/%d/%Y", "%Y-%m-%d"];

/// Parse a sheet date plus a time cell. First matching format wins.
pub fn parse_date_time(date: &str, time: &str) -> Option<NaiveDateTime> {
    parse_naive(&format!("{} {}", date.trim(), time.trim()))
}

fn parse_naive(value: &str) -> Option<NaiveDateTime> {
    DATE_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}

/// Attach the configured timezone. Times that do not exist locally (DST gap)
/// are treated as absent; ambiguous ones take the earlier instant.
pub fn localize(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&naive).earliest()
}

pub fn parse_local(date: &str, time: &str, tz: Tz) -> Option<DateTime<Tz>> {
    parse_date_time(date, time).and_then(|naive| localize(naive, tz))
}

/// Parse one end of a date window: a full date-time, or a bare date meaning
/// start of day (`end_of_day = false`) or its last second.
pub fn parse_window_bound(value: &str, end_of_day: bool, tz: Tz) -> Option<DateTime<Tz>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Some(naive) = parse_naive(value) {
        return localize(naive, tz);
    }

    let date = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())?;
    let time = if end_of_day {
        NaiveTime::from_hms_opt(23, 59, 59)?
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)?
    };
    localize(date.and_time(time), tz)
}

/// What to do with the external scheduled event mirrored for a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledEventAction {
    Create,
    Update(String),
    Delete(String),
    Skip,
}

/// Start is not in the past and falls within `lead_days` whole days.
pub fn within_lead_time(start: DateTime<Tz>, now: DateTime<Tz>, lead_days: i64) -> bool {
    let until = start.signed_duration_since(now);
    until >= chrono::Duration::zero() && until.num_days() <= lead_days
}

pub fn plan_scheduled_event(
    existing: Option<&str>,
    start: DateTime<Tz>,
    end: DateTime<Tz>,
    now: DateTime<Tz>,
    lead_days: i64,
) -> ScheduledEventAction {
    let upcoming = within_lead_time(start, now, lead_days);
    match existing.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) if end < now => ScheduledEventAction::Delete(id.to_string()),
        Some(id) if upcoming => ScheduledEventAction::Update(id.to_string()),
        Some(_) => ScheduledEventAction::Skip,
        None if upcoming => ScheduledEventAction::Create,
        None => ScheduledEventAction::Skip,
    }
}
