//! Sheet poller: diff status columns and send notifications.
//!
//! Each poll cycle:
//! 1. Read every configured tab
//! 2. For each data row, fire the "submitted" and "approved" notices whose
//!    status column is not yet `SENT`
//! 3. Write `SENT` back after a successful send
//! 4. Mirror approved rows into the calendar and guild scheduled events
//!
//! Failures are logged per tab/row and the cycle moves on; unmarked rows are
//! naturally retried on the next cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::layout::{ApprovedNotice, Routing, SheetJob, SheetRow, SubmittedNotice};
use crate::google::{CalendarSink, SENT_MARKER, SheetStore};
use crate::platform::{ChannelId, ChatPlatform, ScheduledEventSpec};
use crate::schedule::{ScheduledEventAction, localize, parse_date_time, plan_scheduled_event};

/// Counters for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub rows: usize,
    pub submitted: usize,
    pub approved: usize,
    pub unrouted: usize,
    pub errors: usize,
}

pub struct SheetNotifier {
    job: SheetJob,
    store: Arc<dyn SheetStore>,
    platform: Arc<dyn ChatPlatform>,
    calendar: Option<Arc<dyn CalendarSink>>,
    tz: Tz,
}

impl SheetNotifier {
    pub fn new(
        job: SheetJob,
        store: Arc<dyn SheetStore>,
        platform: Arc<dyn ChatPlatform>,
        calendar: Option<Arc<dyn CalendarSink>>,
        tz: Tz,
    ) -> Self {
        Self {
            job,
            store,
            platform,
            calendar,
            tz,
        }
    }

    pub fn job(&self) -> &SheetJob {
        &self.job
    }

    pub async fn poll_once(&self) -> PollSummary {
        self.poll_at(Utc::now().with_timezone(&self.tz)).await
    }

    /// Run one cycle with `now` as the reference time.
    pub async fn poll_at(&self, now: DateTime<Tz>) -> PollSummary {
        let mut summary = PollSummary::default();

        for tab in &self.job.tabs {
            let rows = match self.store.rows(tab).await {
                Ok(rows) => rows,
                Err(e) => {
                    error!(job = %self.job.name, tab = %tab, error = %e, "Failed to load sheet tab");
                    summary.errors += 1;
                    continue;
                }
            };

            for (index, cells) in rows.into_iter().enumerate().skip(self.job.header_rows) {
                let row = SheetRow::new(index + 1, cells, &self.job);
                summary.rows += 1;
                if self.process_row(tab, &row, now, &mut summary).await
                    && self.job.row_delay_ms > 0
                {
                    tokio::time::sleep(Duration::from_millis(self.job.row_delay_ms)).await;
                }
            }
        }

        if summary.submitted + summary.approved + summary.errors > 0 {
            info!(
                job = %self.job.name,
                rows = summary.rows,
                submitted = summary.submitted,
                approved = summary.approved,
                unrouted = summary.unrouted,
                errors = summary.errors,
                "Sheet poll finished"
            );
        }
        summary
    }

    /// Returns whether anything was sent for the row.
    async fn process_row(
        &self,
        tab: &str,
        row: &SheetRow,
        now: DateTime<Tz>,
        summary: &mut PollSummary,
    ) -> bool {
        let mut sent = false;

        if let Some(notice) = &self.job.submitted {
            if !row.requester.is_empty() && !row.is_sent(notice.status_column) {
                sent |= self.notify_submitted(tab, row, notice, summary).await;
                if notice.exclusive {
                    return sent;
                }
            }
        }

        if let Some(notice) = &self.job.approved {
            if row.is_approved(&self.job.columns.approvers, &notice.approval_value)
                && !row.is_sent(notice.status_column)
            {
                sent |= self.notify_approved(tab, row, notice, now, summary).await;
            }
        }

        sent
    }

    async fn notify_submitted(
        &self,
        tab: &str,
        row: &SheetRow,
        notice: &SubmittedNotice,
        summary: &mut PollSummary,
    ) -> bool {
        if !self.send(notice.channel_id, &row.render(&notice.template), tab, row, summary).await {
            return false;
        }
        if self.mark(tab, row, notice.status_column, SENT_MARKER, summary).await {
            summary.submitted += 1;
        }
        true
    }

    async fn notify_approved(
        &self,
        tab: &str,
        row: &SheetRow,
        notice: &ApprovedNotice,
        now: DateTime<Tz>,
        summary: &mut PollSummary,
    ) -> bool {
        let delivered = match &notice.routing {
            Routing::Category { template, .. } => {
                let Some(channel) = notice.routing.channel_for_category(&row.category) else {
                    warn!(
                        job = %self.job.name,
                        tab = %tab,
                        row = row.number,
                        category = %row.category,
                        "Unknown category; approval notice not sent"
                    );
                    summary.unrouted += 1;
                    return false;
                };
                self.send(channel, &row.render(template), tab, row, summary).await
            }
            // Marked only when every fired route was delivered.
            Routing::Flags { routes } => {
                let mut fired = 0;
                let mut failed = 0;
                for route in routes.iter().filter(|r| r.columns.iter().any(|c| row.flag(*c))) {
                    fired += 1;
                    if !self.send(route.channel_id, &row.render(&route.template), tab, row, summary).await {
                        failed += 1;
                    }
                }
                if failed > 0 {
                    warn!(
                        job = %self.job.name,
                        tab = %tab,
                        row = row.number,
                        failed,
                        "Approval routes failed; row left unmarked"
                    );
                }
                fired > 0 && failed == 0
            }
        };

        if !delivered {
            return false;
        }
        // Only rows whose status cell was written get mirrored.
        if !self.mark(tab, row, notice.status_column, SENT_MARKER, summary).await {
            return true;
        }
        summary.approved += 1;
        self.mirror_event(tab, row, now, summary).await;
        true
    }

    async fn send(
        &self,
        channel: ChannelId,
        content: &str,
        tab: &str,
        row: &SheetRow,
        summary: &mut PollSummary,
    ) -> bool {
        match self.platform.send_message(channel, content).await {
            Ok(()) => {
                debug!(job = %self.job.name, tab = %tab, row = row.number, channel, "Notification sent");
                true
            }
            Err(e) => {
                error!(
                    job = %self.job.name,
                    tab = %tab,
                    row = row.number,
                    channel,
                    error = %e,
                    "Failed to send notification"
                );
                summary.errors += 1;
                false
            }
        }
    }

    async fn mark(
        &self,
        tab: &str,
        row: &SheetRow,
        column: usize,
        value: &str,
        summary: &mut PollSummary,
    ) -> bool {
        match self.store.update_cell(tab, row.number, column, value).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    job = %self.job.name,
                    tab = %tab,
                    row = row.number,
                    column,
                    error = %e,
                    "Failed to write status cell"
                );
                summary.errors += 1;
                false
            }
        }
    }

    /// Calendar entry plus scheduled-event create/update/delete.
    async fn mirror_event(&self, tab: &str, row: &SheetRow, now: DateTime<Tz>, summary: &mut PollSummary) {
        let Some(mirror) = &self.job.calendar else {
            return;
        };
        let columns = &self.job.columns;
        let date = row.optional_cell(columns.date);
        let start = row.optional_cell(columns.start_time);
        let end = row.optional_cell(columns.end_time);
        if date.is_empty() || start.is_empty() || end.is_empty() {
            return;
        }

        let (Some(start_naive), Some(end_naive)) =
            (parse_date_time(date, start), parse_date_time(date, end))
        else {
            debug!(tab = %tab, row = row.number, "Unparseable event date; skipping calendar");
            return;
        };

        if let (Some(calendar), Some(_)) = (&self.calendar, &mirror.calendar_id) {
            match calendar.create_event(&row.title, start_naive, end_naive).await {
                Ok(link) => info!(row = row.number, link = link.as_deref().unwrap_or(""), "Calendar entry created"),
                Err(e) => {
                    warn!(tab = %tab, row = row.number, error = %e, "Calendar entry failed");
                    summary.errors += 1;
                }
            }
        }

        let Some(event_column) = columns.event_id else {
            return;
        };
        let (Some(start_at), Some(end_at)) = (localize(start_naive, self.tz), localize(end_naive, self.tz))
        else {
            return;
        };

        let spec = ScheduledEventSpec {
            name: row.title.clone(),
            description: row.title.clone(),
            location: mirror.location.clone(),
            start: start_at.with_timezone(&Utc),
            end: end_at.with_timezone(&Utc),
        };

        let existing = row.cell(event_column);
        match plan_scheduled_event(Some(existing), start_at, end_at, now, mirror.lead_time_days) {
            ScheduledEventAction::Create => match self.platform.create_scheduled_event(&spec).await {
                Ok(id) => {
                    info!(event = %spec.name, id = %id, "Scheduled event created");
                    self.mark(tab, row, event_column, &id, summary).await;
                }
                Err(e) => {
                    error!(event = %spec.name, error = %e, "Failed to create scheduled event");
                    summary.errors += 1;
                }
            },
            ScheduledEventAction::Update(id) => {
                match self.platform.update_scheduled_event(&id, &spec).await {
                    Ok(()) => info!(event = %spec.name, id = %id, "Scheduled event updated"),
                    Err(e) => {
                        error!(event = %spec.name, id = %id, error = %e, "Failed to update scheduled event");
                        summary.errors += 1;
                    }
                }
            }
            ScheduledEventAction::Delete(id) => {
                match self.platform.delete_scheduled_event(&id).await {
                    Ok(()) => {
                        info!(id = %id, "Scheduled event deleted");
                        self.mark(tab, row, event_column, "", summary).await;
                    }
                    Err(e) => {
                        error!(id = %id, error = %e, "Failed to delete scheduled event");
                        summary.errors += 1;
                    }
                }
            }
            ScheduledEventAction::Skip => {
                debug!(event = %spec.name, "Event outside lead window; no scheduled event");
            }
        }
    }
}

/// Spawn a background task that polls the job on its interval.
///
/// Ticks are awaited serially, so a slow cycle delays the next one rather
/// than overlapping it. Returns a `JoinHandle` and a shutdown flag.
pub fn spawn_sheet_poller(notifier: Arc<SheetNotifier>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let job = notifier.job();
        info!(
            job = %job.name,
            tabs = job.tabs.len(),
            "Sheet poller started, polling every {}s",
            job.poll_interval_secs
        );

        let mut tick = tokio::time::interval(Duration::from_secs(job.poll_interval_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!(job = %job.name, "Sheet poller shutting down");
                return;
            }

            notifier.poll_once().await;
        }
    });

    (handle, shutdown_flag)
}
