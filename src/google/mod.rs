//! Google adapters: service-account auth, Sheets values, Calendar events.

pub mod auth;
pub mod calendar;
pub mod sheets;

pub use auth::{ServiceAccountKey, TokenSource};
pub use calendar::{CalendarSink, GoogleCalendar};
pub use sheets::{GoogleSheets, SENT_MARKER, SheetAuth, SheetStore};
