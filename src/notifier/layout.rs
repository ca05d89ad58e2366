//! Sheet job configuration: column layout, routing and message templates.
//!
//! Column positions are 1-based, matching the spreadsheet UI.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::platform::ChannelId;

fn default_header_rows() -> usize {
    1
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_approval_value() -> String {
    "approved".to_string()
}

fn default_lead_time_days() -> i64 {
    14
}

fn default_location() -> String {
    "TBA".to_string()
}

/// One polled spreadsheet: its tabs, layout and notifications.
#[derive(Debug, Clone, Deserialize)]
pub struct SheetJob {
    /// Label used in logs.
    pub name: String,
    pub spreadsheet_id: String,
    pub tabs: Vec<String>,
    #[serde(default = "default_header_rows")]
    pub header_rows: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Pause between rows that triggered a notification.
    #[serde(default)]
    pub row_delay_ms: u64,
    pub columns: ColumnLayout,
    #[serde(default)]
    pub submitted: Option<SubmittedNotice>,
    #[serde(default)]
    pub approved: Option<ApprovedNotice>,
    #[serde(default)]
    pub calendar: Option<CalendarMirror>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnLayout {
    pub requester: usize,
    #[serde(default)]
    pub category: Option<usize>,
    /// Candidate title columns; the first non-empty one wins.
    #[serde(default)]
    pub title: Vec<usize>,
    #[serde(default)]
    pub approvers: Vec<usize>,
    #[serde(default)]
    pub date: Option<usize>,
    #[serde(default)]
    pub start_time: Option<usize>,
    #[serde(default)]
    pub end_time: Option<usize>,
    /// Holds the ID of the mirrored scheduled event.
    #[serde(default)]
    pub event_id: Option<usize>,
}

/// "Request submitted" notification.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmittedNotice {
    pub status_column: usize,
    pub channel_id: ChannelId,
    pub template: String,
    /// Stop examining the row for this poll once the notice fired.
    #[serde(default)]
    pub exclusive: bool,
}

/// "Request approved" notification.
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovedNotice {
    pub status_column: usize,
    #[serde(default = "default_approval_value")]
    pub approval_value: String,
    pub routing: Routing,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Routing {
    /// Channel chosen by the row's category.
    Category {
        channels: HashMap<String, ChannelId>,
        template: String,
    },
    /// Every route whose flag columns are set gets a message.
    Flags { routes: Vec<FlagRoute> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlagRoute {
    pub columns: Vec<usize>,
    pub channel_id: ChannelId,
    pub template: String,
}

impl Routing {
    /// Case-insensitive category lookup.
    pub fn channel_for_category(&self, category: &str) -> Option<ChannelId> {
        match self {
            Self::Category { channels, .. } => channels
                .iter()
                .find(|(name, _)| name.trim().eq_ignore_ascii_case(category.trim()))
                .map(|(_, id)| *id),
            Self::Flags { .. } => None,
        }
    }
}

/// Calendar and scheduled-event mirroring for approved rows.
#[derive(Debug, Clone, Deserialize)]
pub struct CalendarMirror {
    /// Google Calendar to insert into; `None` skips calendar entries.
    #[serde(default)]
    pub calendar_id: Option<String>,
    #[serde(default = "default_lead_time_days")]
    pub lead_time_days: i64,
    #[serde(default = "default_location")]
    pub location: String,
}

impl SheetJob {
    /// Widest column any part of the job reads or writes.
    pub fn max_column(&self) -> usize {
        let c = &self.columns;
        let mut cols = vec![c.requester];
        cols.extend(c.category);
        cols.extend(c.title.iter().copied());
        cols.extend(c.approvers.iter().copied());
        cols.extend([c.date, c.start_time, c.end_time, c.event_id].into_iter().flatten());
        if let Some(s) = &self.submitted {
            cols.push(s.status_column);
        }
        if let Some(a) = &self.approved {
            cols.push(a.status_column);
            if let Routing::Flags { routes } = &a.routing {
                cols.extend(routes.iter().flat_map(|r| r.columns.iter().copied()));
            }
        }
        cols.into_iter().max().unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let key = |field: &str| format!("sheets[{}].{field}", self.name);

        if self.spreadsheet_id.trim().is_empty() {
            return Err(ConfigError::invalid(key("spreadsheet_id"), "must not be empty"));
        }
        if self.tabs.is_empty() {
            return Err(ConfigError::invalid(key("tabs"), "at least one tab is needed"));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::invalid(key("poll_interval_secs"), "must be positive"));
        }

        let c = &self.columns;
        let mut all = vec![c.requester];
        all.extend(c.category);
        all.extend(c.title.iter().copied());
        all.extend(c.approvers.iter().copied());
        all.extend([c.date, c.start_time, c.end_time, c.event_id].into_iter().flatten());
        all.extend(self.submitted.as_ref().map(|s| s.status_column));
        all.extend(self.approved.as_ref().map(|a| a.status_column));
        if all.contains(&0) {
            return Err(ConfigError::invalid(key("columns"), "columns are 1-based"));
        }

        if let Some(approved) = &self.approved {
            if c.approvers.is_empty() {
                return Err(ConfigError::invalid(
                    key("columns.approvers"),
                    "approval notices need at least one approver column",
                ));
            }
            match &approved.routing {
                Routing::Category { channels, .. } => {
                    if c.category.is_none() {
                        return Err(ConfigError::invalid(
                            key("columns.category"),
                            "category routing needs a category column",
                        ));
                    }
                    if channels.is_empty() {
                        return Err(ConfigError::invalid(
                            key("approved.routing.channels"),
                            "at least one category channel is needed",
                        ));
                    }
                }
                Routing::Flags { routes } => {
                    if routes.iter().any(|r| r.columns.is_empty() || r.columns.contains(&0)) {
                        return Err(ConfigError::invalid(
                            key("approved.routing.routes"),
                            "each route needs 1-based flag columns",
                        ));
                    }
                }
            }
        }

        if self.calendar.is_some()
            && (c.date.is_none() || c.start_time.is_none() || c.end_time.is_none())
        {
            return Err(ConfigError::invalid(
                key("calendar"),
                "calendar mirroring needs date, start_time and end_time columns",
            ));
        }

        Ok(())
    }
}

/// One data row with the job's fields pulled out.
#[derive(Debug, Clone)]
pub struct SheetRow {
    /// 1-based row number in the sheet.
    pub number: usize,
    pub requester: String,
    pub category: String,
    pub title: String,
    cells: Vec<String>,
}

impl SheetRow {
    pub fn new(number: usize, mut cells: Vec<String>, job: &SheetJob) -> Self {
        let width = job.max_column();
        if cells.len() < width {
            cells.resize(width, String::new());
        }

        let cell = |col: usize| cells[col - 1].trim().to_string();
        let requester = cell(job.columns.requester);
        let category = job
            .columns
            .category
            .map(|col| cell(col).to_lowercase())
            .unwrap_or_default();
        let title = job
            .columns
            .title
            .iter()
            .map(|col| cell(*col))
            .find(|t| !t.is_empty())
            .unwrap_or_else(|| "a request".to_string());

        Self {
            number,
            requester,
            category,
            title,
            cells,
        }
    }

    /// Trimmed cell value at a 1-based column; empty when out of range.
    pub fn cell(&self, column: usize) -> &str {
        column
            .checked_sub(1)
            .and_then(|i| self.cells.get(i))
            .map(|s| s.trim())
            .unwrap_or("")
    }

    pub fn optional_cell(&self, column: Option<usize>) -> &str {
        column.map(|c| self.cell(c)).unwrap_or("")
    }

    /// Whether a status column already carries the sent marker.
    pub fn is_sent(&self, status_column: usize) -> bool {
        self.cell(status_column).eq_ignore_ascii_case("sent")
    }

    /// `true`/`yes`, case-insensitive.
    pub fn flag(&self, column: usize) -> bool {
        let value = self.cell(column);
        value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
    }

    /// Every approver column equals the approval value.
    pub fn is_approved(&self, approvers: &[usize], approval_value: &str) -> bool {
        !approvers.is_empty()
            && approvers
                .iter()
                .all(|col| self.cell(*col).eq_ignore_ascii_case(approval_value.trim()))
    }

    /// Fill `{requester}`, `{category}` and `{title}` placeholders.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{requester}", &self.requester)
            .replace("{category}", &self.category)
            .replace("{title}", &self.title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_job() -> SheetJob {
        serde_json::from_value(serde_json::json!({
            "name": "events",
            "spreadsheet_id": "abc",
            "tabs": ["Use this one"],
            "columns": {
                "requester": 2, "category": 3, "title": [7, 12],
                "date": 13, "start_time": 14, "end_time": 15,
                "approvers": [24, 25, 26], "event_id": 29
            },
            "submitted": { "status_column": 27, "channel_id": 1, "template": "{requester} / {category}" },
            "approved": {
                "status_column": 28,
                "routing": { "kind": "category", "channels": { "Large Group": 10 }, "template": "{title}" }
            },
            "calendar": { "calendar_id": "team@example.com" }
        }))
        .unwrap()
    }

    fn cells(values: &[(usize, &str)]) -> Vec<String> {
        let width = values.iter().map(|(c, _)| *c).max().unwrap_or(0);
        let mut row = vec![String::new(); width];
        for (col, value) in values {
            row[col - 1] = value.to_string();
        }
        row
    }

    #[test]
    fn defaults_are_applied() {
        let job = event_job();
        assert_eq!(job.header_rows, 1);
        assert_eq!(job.poll_interval_secs, 60);
        let approved = job.approved.as_ref().unwrap();
        assert_eq!(approved.approval_value, "approved");
        let calendar = job.calendar.as_ref().unwrap();
        assert_eq!(calendar.lead_time_days, 14);
        assert_eq!(calendar.location, "TBA");
        assert!(job.validate().is_ok());
    }

    #[test]
    fn max_column_covers_status_and_event_columns() {
        assert_eq!(event_job().max_column(), 29);
    }

    #[test]
    fn short_rows_are_padded() {
        let job = event_job();
        let row = SheetRow::new(2, cells(&[(2, " Alice ")]), &job);
        assert_eq!(row.requester, "Alice");
        assert_eq!(row.cell(29), "");
        assert_eq!(row.cell(500), "");
        assert_eq!(row.title, "a request");
    }

    #[test]
    fn title_falls_back_through_candidates() {
        let job = event_job();
        let row = SheetRow::new(2, cells(&[(12, "Beach day")]), &job);
        assert_eq!(row.title, "Beach day");
        let row = SheetRow::new(2, cells(&[(7, "Bible study"), (12, "Beach day")]), &job);
        assert_eq!(row.title, "Bible study");
    }

    #[test]
    fn approval_is_case_insensitive_and_total() {
        let job = event_job();
        let approvers = &job.columns.approvers;
        let row = SheetRow::new(2, cells(&[(24, "Approved"), (25, "APPROVED"), (26, " approved ")]), &job);
        assert!(row.is_approved(approvers, "approved"));
        let row = SheetRow::new(2, cells(&[(24, "approved"), (25, "approved"), (26, "pending")]), &job);
        assert!(!row.is_approved(approvers, "approved"));
        assert!(!row.is_approved(&[], "approved"));
    }

    #[test]
    fn sent_marker_and_flags() {
        let job = event_job();
        let row = SheetRow::new(2, cells(&[(27, "sent"), (10, "TRUE"), (11, "no")]), &job);
        assert!(row.is_sent(27));
        assert!(!row.is_sent(28));
        assert!(row.flag(10));
        assert!(!row.flag(11));
    }

    #[test]
    fn category_lookup_ignores_case() {
        let job = event_job();
        let routing = &job.approved.as_ref().unwrap().routing;
        assert_eq!(routing.channel_for_category("large group"), Some(10));
        assert_eq!(routing.channel_for_category("outreach"), None);
    }

    #[test]
    fn templates_render_fields() {
        let job = event_job();
        let row = SheetRow::new(2, cells(&[(2, "Alice"), (3, "Worship")]), &job);
        assert_eq!(row.render("{requester} / {category}"), "Alice / worship");
    }

    #[test]
    fn validation_catches_bad_layouts() {
        let mut job = event_job();
        job.columns.approvers.clear();
        assert!(job.validate().is_err());

        let mut job = event_job();
        job.columns.requester = 0;
        assert!(job.validate().is_err());

        let mut job = event_job();
        job.columns.date = None;
        assert!(job.validate().is_err());

        let mut job = event_job();
        job.tabs.clear();
        assert!(job.validate().is_err());
    }
}
