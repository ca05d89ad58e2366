//! Spreadsheet access: the `SheetStore` trait and a Google Sheets v4 client.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use super::auth::TokenSource;
use crate::error::SheetError;

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com";

/// Marker written into status columns once a notification went out.
pub const SENT_MARKER: &str = "SENT";

/// Row/cell access to one spreadsheet. Rows and columns are 1-based.
#[async_trait]
pub trait SheetStore: Send + Sync {
    /// All rows of a tab, header included, as displayed strings.
    async fn rows(&self, tab: &str) -> Result<Vec<Vec<String>>, SheetError>;

    async fn update_cell(
        &self,
        tab: &str,
        row: usize,
        column: usize,
        value: &str,
    ) -> Result<(), SheetError>;
}

/// How requests are authorized.
#[derive(Clone)]
pub enum SheetAuth {
    /// Service account bearer tokens; read and write.
    ServiceAccount(Arc<TokenSource>),
    /// API key for publicly shared sheets; read only.
    ApiKey(SecretString),
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Google Sheets v4 values API client bound to one spreadsheet.
pub struct GoogleSheets {
    spreadsheet_id: String,
    auth: SheetAuth,
    client: reqwest::Client,
    base_url: String,
}

impl GoogleSheets {
    pub fn new(spreadsheet_id: impl Into<String>, auth: SheetAuth) -> Self {
        Self::with_base_url(spreadsheet_id, auth, SHEETS_API_BASE)
    }

    pub fn with_base_url(
        spreadsheet_id: impl Into<String>,
        auth: SheetAuth,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            auth,
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn values_url(&self, range: &str) -> Result<Url, SheetError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| SheetError::RequestFailed {
            range: range.to_string(),
            reason: e.to_string(),
        })?;
        url.path_segments_mut()
            .map_err(|()| SheetError::RequestFailed {
                range: range.to_string(),
                reason: "base URL cannot hold a path".into(),
            })?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.spreadsheet_id.as_str(), "values", range]);
        Ok(url)
    }

    async fn authorize(
        &self,
        request: reqwest::RequestBuilder,
        write: bool,
    ) -> Result<reqwest::RequestBuilder, SheetError> {
        match &self.auth {
            SheetAuth::ServiceAccount(tokens) => Ok(request.bearer_auth(tokens.token().await?)),
            SheetAuth::ApiKey(_) if write => Err(SheetError::ReadOnly),
            SheetAuth::ApiKey(key) => Ok(request.query(&[("key", key.expose_secret())])),
        }
    }
}

#[async_trait]
impl SheetStore for GoogleSheets {
    async fn rows(&self, tab: &str) -> Result<Vec<Vec<String>>, SheetError> {
        let range = quote_tab(tab);
        let url = self.values_url(&range)?;
        let request = self.authorize(self.client.get(url), false).await?;

        let failed = |reason: String| SheetError::RequestFailed {
            range: range.clone(),
            reason,
        };

        let resp = request.send().await.map_err(|e| failed(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(failed(format!("{status}: {body}")));
        }

        let values: ValueRange = resp.json().await.map_err(|e| failed(e.to_string()))?;
        debug!(tab = %tab, rows = values.values.len(), "Fetched sheet rows");

        Ok(values
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_to_string).collect())
            .collect())
    }

    async fn update_cell(
        &self,
        tab: &str,
        row: usize,
        column: usize,
        value: &str,
    ) -> Result<(), SheetError> {
        let range = format!("{}!{}{row}", quote_tab(tab), column_letters(column)?);
        let mut url = self.values_url(&range)?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");

        let request = self
            .authorize(self.client.put(url), true)
            .await?
            .json(&serde_json::json!({ "range": range, "values": [[value]] }));

        let resp = request.send().await.map_err(|e| SheetError::RequestFailed {
            range: range.clone(),
            reason: e.to_string(),
        })?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SheetError::RequestFailed {
                range,
                reason: format!("{status}: {body}"),
            });
        }

        debug!(range = %range, "Updated sheet cell");
        Ok(())
    }
}

/// Quote a tab name for A1 notation (`'It''s'`).
pub fn quote_tab(tab: &str) -> String {
    format!("'{}'", tab.replace('\'', "''"))
}

/// 1-based column index to A1 letters: 1 → A, 27 → AA.
pub fn column_letters(column: usize) -> Result<String, SheetError> {
    if column == 0 {
        return Err(SheetError::InvalidColumn(column));
    }
    let mut n = column;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    Ok(String::from_utf8_lossy(&letters).into_owned())
}

fn cell_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
