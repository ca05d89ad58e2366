//! Calendar entries for approved event requests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Url;
use serde::Deserialize;
use tracing::info;

use super::auth::TokenSource;
use crate::error::CalendarError;

const CALENDAR_API_BASE: &str = "https://www.googleapis.com";

/// Creates calendar entries; returns a link to the entry when the backend
/// provides one.
#[async_trait]
pub trait CalendarSink: Send + Sync {
    async fn create_event(
        &self,
        summary: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Option<String>, CalendarError>;
}

#[derive(Deserialize)]
struct InsertedEvent {
    #[serde(rename = "htmlLink")]
    html_link: Option<String>,
}

/// Google Calendar v3 events client for one calendar.
pub struct GoogleCalendar {
    calendar_id: String,
    time_zone: String,
    tokens: Arc<TokenSource>,
    client: reqwest::Client,
    base_url: String,
}

impl GoogleCalendar {
    pub fn new(
        calendar_id: impl Into<String>,
        time_zone: impl Into<String>,
        tokens: Arc<TokenSource>,
    ) -> Self {
        Self::with_base_url(calendar_id, time_zone, tokens, CALENDAR_API_BASE)
    }

    pub fn with_base_url(
        calendar_id: impl Into<String>,
        time_zone: impl Into<String>,
        tokens: Arc<TokenSource>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            calendar_id: calendar_id.into(),
            time_zone: time_zone.into(),
            tokens,
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn events_url(&self) -> Result<Url, CalendarError> {
        let failed = |reason: String| CalendarError::RequestFailed {
            calendar_id: self.calendar_id.clone(),
            reason,
        };
        let mut url = Url::parse(&self.base_url).map_err(|e| failed(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| failed("base URL cannot hold a path".into()))?
            .pop_if_empty()
            .extend(["calendar", "v3", "calendars", self.calendar_id.as_str(), "events"]);
        Ok(url)
    }
}

/// Request body for a timed event in a named IANA timezone.
pub fn event_body(summary: &str, start: NaiveDateTime, end: NaiveDateTime, time_zone: &str) -> serde_json::Value {
    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
    serde_json::json!({
        "summary": summary,
        "start": { "dateTime": start.format(FORMAT).to_string(), "timeZone": time_zone },
        "end": { "dateTime": end.format(FORMAT).to_string(), "timeZone": time_zone },
    })
}

#[async_trait]
impl CalendarSink for GoogleCalendar {
    async fn create_event(
        &self,
        summary: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Option<String>, CalendarError> {
        let failed = |reason: String| CalendarError::RequestFailed {
            calendar_id: self.calendar_id.clone(),
            reason,
        };

        let token = self.tokens.token().await?;
        let resp = self
            .client
            .post(self.events_url()?)
            .bearer_auth(token)
            .json(&event_body(summary, start, end, &self.time_zone))
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(failed(format!("{status}: {body}")));
        }

        let event: InsertedEvent = resp.json().await.map_err(|e| failed(e.to_string()))?;
        info!(calendar = %self.calendar_id, summary = %summary, "Calendar event created");
        Ok(event.html_link)
    }
}
