//! HTTP surface: liveness text and the active-links page.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::error::ConfigError;
use crate::google::SheetStore;
use crate::schedule::parse_window_bound;

pub const LIVENESS_TEXT: &str = "✅ Bot is running and alive!";

fn default_header_rows() -> usize {
    1
}

/// Sheet tab listing links with a display window.
#[derive(Debug, Clone, Deserialize)]
pub struct LinksSheet {
    pub spreadsheet_id: String,
    pub tab: String,
    #[serde(default = "default_header_rows")]
    pub header_rows: usize,
    pub title_column: usize,
    pub url_column: usize,
    pub start_column: usize,
    pub end_column: usize,
}

impl LinksSheet {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spreadsheet_id.trim().is_empty() || self.tab.trim().is_empty() {
            return Err(ConfigError::invalid("links", "spreadsheet_id and tab are required"));
        }
        let columns = [self.title_column, self.url_column, self.start_column, self.end_column];
        if columns.contains(&0) {
            return Err(ConfigError::invalid("links", "columns are 1-based"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub title: String,
    pub url: String,
}

/// Shared state for the HTTP routes.
#[derive(Clone)]
pub struct HttpState {
    pub links: Option<(LinksSheet, Arc<dyn SheetStore>)>,
    pub tz: Tz,
}

/// Links whose `[start, end]` window contains `now`. Rows with a missing
/// URL or an unparseable bound are left out.
pub fn active_links(rows: &[Vec<String>], layout: &LinksSheet, now: DateTime<Tz>) -> Vec<Link> {
    let tz = now.timezone();
    let cell = |row: &Vec<String>, col: usize| -> String {
        col.checked_sub(1)
            .and_then(|i| row.get(i))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };

    rows.iter()
        .skip(layout.header_rows)
        .filter_map(|row| {
            let url = cell(row, layout.url_column);
            if url.is_empty() {
                return None;
            }
            let start = parse_window_bound(&cell(row, layout.start_column), false, tz)?;
            let end = parse_window_bound(&cell(row, layout.end_column), true, tz)?;
            if now < start || now > end {
                return None;
            }
            let title = cell(row, layout.title_column);
            Some(Link {
                title: if title.is_empty() { url.clone() } else { title },
                url,
            })
        })
        .collect()
}

/// Escapes text for element content and quoted attribute values (`href="..."`).
fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

pub fn render_links(links: &[Link]) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Links</title></head><body>\n",
    );
    if links.is_empty() {
        html.push_str("<p>No links right now.</p>\n");
    } else {
        html.push_str("<ul>\n");
        for link in links {
            html.push_str(&format!(
                "<li><a href=\"{}\">{}</a></li>\n",
                escape_html(&link.url),
                escape_html(&link.title)
            ));
        }
        html.push_str("</ul>\n");
    }
    html.push_str("</body></html>\n");
    html
}

/// GET /
async fn liveness() -> &'static str {
    LIVENESS_TEXT
}

/// GET /links
///
/// 404 when no links sheet is configured, 502 when the sheet cannot be read.
async fn links(State(state): State<HttpState>) -> Response {
    let Some((layout, store)) = &state.links else {
        return (StatusCode::NOT_FOUND, "No links sheet configured").into_response();
    };

    match store.rows(&layout.tab).await {
        Ok(rows) => {
            let now = Utc::now().with_timezone(&state.tz);
            Html(render_links(&active_links(&rows, layout, now))).into_response()
        }
        Err(e) => {
            tracing::error!(tab = %layout.tab, error = %e, "Failed to read links sheet");
            (StatusCode::BAD_GATEWAY, "Links sheet unavailable").into_response()
        }
    }
}

/// Build the HTTP routes.
pub fn http_routes(state: HttpState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/links", get(links))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
