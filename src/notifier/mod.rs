//! Spreadsheet-driven notifications.

pub mod layout;
pub mod poller;

pub use layout::{
    ApprovedNotice, CalendarMirror, ColumnLayout, FlagRoute, Routing, SheetJob, SheetRow,
    SubmittedNotice,
};
pub use poller::{PollSummary, SheetNotifier, spawn_sheet_poller};
