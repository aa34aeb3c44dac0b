//! Built-in source extractors.
//!
//! Every extractor takes a serialized source descriptor
//! (`{"id", "kind", "location", "format", "metadata"}`) and returns the
//! extracted payload. A missing file is reported as
//! [`CapabilityError::ResourceNotFound`] so callers can tell it apart from a
//! broken extractor.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::rows::Row as Record;
use crate::error::CapabilityError;
use crate::registry::{Capability, CapabilityKind, CapabilityShape};

/// File formats the built-in file extractor parses natively.
pub const SUPPORTED_FILE_FORMATS: &[&str] = &["csv", "json", "txt", "md", "markdown", "html", "htm"];

/// Maximum characters of visible page text kept by the web extractor.
pub const WEB_TEXT_LIMIT: usize = 10_000;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "Mozilla/5.0 (compatible; aria-forge/0.1)";

/// Fields of a source descriptor the extractors read.
#[derive(Debug, Clone)]
struct SourceInput {
    location: String,
    format: Option<String>,
    metadata: Map<String, Value>,
}

impl SourceInput {
    fn from_value(input: &Value) -> Result<Self, CapabilityError> {
        let location = input
            .get("location")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| CapabilityError::InvalidInput("source has no location".to_string()))?
            .to_string();
        let format = input
            .get("format")
            .and_then(Value::as_str)
            .map(|f| f.trim().to_lowercase())
            .filter(|f| !f.is_empty());
        let metadata = input
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            location,
            format,
            metadata,
        })
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Effective format of a file source: declared format, else the extension.
pub fn effective_file_format(location: &str, declared: Option<&str>) -> Option<String> {
    declared
        .map(str::to_lowercase)
        .filter(|f| !f.is_empty())
        .or_else(|| {
            Path::new(location)
                .extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_lowercase)
        })
}

/// Whether the built-in file extractor handles `format` natively.
pub fn is_supported_file_format(format: &str) -> bool {
    SUPPORTED_FILE_FORMATS.contains(&format)
}

// ============================================================================
// File
// ============================================================================

/// Reads csv, json, text, markdown and html files.
///
/// Unknown formats fall back to a lossy plain-text read tagged
/// `"format": "unknown"`.
#[derive(Debug, Default)]
pub struct FileExtractor;

#[async_trait]
impl Capability for FileExtractor {
    fn name(&self) -> &str {
        "extract_from_file"
    }

    fn description(&self) -> &str {
        "Read a local csv, json, txt, md or html file"
    }

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Extractor
    }

    fn shape(&self) -> CapabilityShape {
        CapabilityShape::source_extractor()
    }

    async fn invoke(&self, input: Value) -> Result<Value, CapabilityError> {
        let source = SourceInput::from_value(&input)?;
        let path = PathBuf::from(&source.location);
        if !path.exists() {
            return Err(CapabilityError::ResourceNotFound(source.location.clone()));
        }

        let format = effective_file_format(&source.location, source.format.as_deref())
            .unwrap_or_else(|| "txt".to_string());
        let bytes = tokio::fs::read(&path).await?;

        match format.as_str() {
            "csv" => {
                let text = String::from_utf8_lossy(&bytes);
                let (columns, rows) = parse_csv(&text)?;
                let row_count = rows.len();
                Ok(json!({
                    "format": "csv",
                    "path": source.location,
                    "columns": columns,
                    "rows": rows.into_iter().map(Value::Object).collect::<Vec<_>>(),
                    "row_count": row_count,
                }))
            }
            "json" => {
                let data: Value = serde_json::from_slice(&bytes)?;
                let count = match &data {
                    Value::Array(items) => items.len(),
                    _ => 1,
                };
                Ok(json!({
                    "format": "json",
                    "path": source.location,
                    "data": data,
                    "count": count,
                }))
            }
            "html" | "htm" => {
                let html = String::from_utf8_lossy(&bytes);
                let text = html_to_text(&html)?;
                Ok(text_payload(&format, &source.location, text))
            }
            "txt" | "md" | "markdown" => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                Ok(text_payload(&format, &source.location, text))
            }
            other => {
                tracing::debug!(format = other, path = %source.location, "Reading unsupported format as text");
                let text = String::from_utf8_lossy(&bytes).into_owned();
                let mut payload = text_payload("unknown", &source.location, text);
                payload["declared_format"] = Value::String(other.to_string());
                Ok(payload)
            }
        }
    }
}

fn text_payload(format: &str, path: &str, content: String) -> Value {
    json!({
        "format": format,
        "path": path,
        "char_count": content.chars().count(),
        "line_count": content.lines().count(),
        "content": content,
    })
}

/// Parse CSV text with a header row.
///
/// Short rows are padded with `null`, surplus cells dropped. Cells that parse
/// as numbers become JSON numbers; empty cells become `null`.
pub fn parse_csv(text: &str) -> Result<(Vec<String>, Vec<Record>), CapabilityError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(text.trim_start_matches('\u{feff}').as_bytes());

    let columns: Vec<String> = reader
        .headers()
        .map_err(csv_error)?
        .iter()
        .map(str::to_string)
        .collect();
    if columns.iter().all(String::is_empty) {
        return Ok((Vec::new(), Vec::new()));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        let mut row = Map::new();
        for (i, column) in columns.iter().enumerate() {
            row.insert(column.clone(), csv_cell(record.get(i).unwrap_or("")));
        }
        rows.push(row);
    }

    Ok((columns, rows))
}

fn csv_error(e: csv::Error) -> CapabilityError {
    CapabilityError::InvalidInput(format!("csv: {}", e))
}

fn csv_cell(cell: &str) -> Value {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    Value::String(cell.to_string())
}

// ============================================================================
// Database
// ============================================================================

/// Runs a query against sqlite or postgres and returns the rows as objects.
///
/// The query comes from `metadata.query`, else `SELECT * FROM <metadata.table>`.
#[derive(Debug, Default)]
pub struct DatabaseExtractor;

#[async_trait]
impl Capability for DatabaseExtractor {
    fn name(&self) -> &str {
        "extract_from_database"
    }

    fn description(&self) -> &str {
        "Run a SQL query against a sqlite file or postgres URL"
    }

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Extractor
    }

    fn shape(&self) -> CapabilityShape {
        CapabilityShape::source_extractor()
    }

    async fn invoke(&self, input: Value) -> Result<Value, CapabilityError> {
        let source = SourceInput::from_value(&input)?;
        let query = database_query(&source)?;
        let location = source.location.as_str();

        let (engine, rows) = if location.starts_with("postgres://") || location.starts_with("postgresql://") {
            ("postgres", query_postgres(location, &query).await?)
        } else {
            let path = location.strip_prefix("sqlite://").or_else(|| location.strip_prefix("sqlite:")).unwrap_or(location);
            if !Path::new(path).exists() {
                return Err(CapabilityError::ResourceNotFound(path.to_string()));
            }
            ("sqlite", query_sqlite(Path::new(path), &query).await?)
        };

        let columns = super::rows::column_order(&rows);
        let count = rows.len();
        Ok(json!({
            "format": engine,
            "query": query,
            "columns": columns,
            "rows": rows.into_iter().map(Value::Object).collect::<Vec<_>>(),
            "count": count,
        }))
    }
}

fn database_query(source: &SourceInput) -> Result<String, CapabilityError> {
    if let Some(query) = source.meta_str("query").filter(|q| !q.trim().is_empty()) {
        return Ok(query.to_string());
    }
    match source.meta_str("table") {
        Some(table) if is_plain_identifier(table) => Ok(format!("SELECT * FROM {}", table)),
        Some(table) => Err(CapabilityError::InvalidInput(format!(
            "table name '{}' is not a plain identifier",
            table
        ))),
        None => Err(CapabilityError::InvalidInput(
            "no SQL query or table provided in metadata".to_string(),
        )),
    }
}

fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

async fn query_sqlite(path: &Path, query: &str) -> Result<Vec<Record>, CapabilityError> {
    let options = SqliteConnectOptions::new().filename(path).read_only(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    let rows = sqlx::query(query).fetch_all(&pool).await?;
    pool.close().await;
    Ok(rows.iter().map(sqlite_row_to_record).collect())
}

fn sqlite_row_to_record(row: &SqliteRow) -> Record {
    let mut record = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
            v.map(super::rows::number_value).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(i) {
            v.map(Value::String).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(i) {
            v.map(|bytes| Value::String(hex::encode(bytes))).unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        record.insert(column.name().to_string(), value);
    }
    record
}

async fn query_postgres(url: &str, query: &str) -> Result<Vec<Record>, CapabilityError> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(HTTP_TIMEOUT)
        .connect(url)
        .await?;
    let rows = sqlx::query(query).fetch_all(&pool).await?;
    pool.close().await;
    Ok(rows.iter().map(pg_row_to_record).collect())
}

fn pg_row_to_record(row: &PgRow) -> Record {
    let mut record = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<i32>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
            v.map(super::rows::number_value).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
            v.map(Value::Bool).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(i) {
            v.map(Value::String).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<Value>, _>(i) {
            v.unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i) {
            v.map(|t| Value::String(t.to_rfc3339())).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(i) {
            v.map(|d| Value::String(d.to_string())).unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        record.insert(column.name().to_string(), value);
    }
    record
}

// ============================================================================
// API
// ============================================================================

/// Calls a REST endpoint and returns its JSON or text body.
#[derive(Debug, Clone)]
pub struct ApiExtractor {
    client: Client,
}

impl ApiExtractor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Default for ApiExtractor {
    fn default() -> Self {
        Self::new(http_client())
    }
}

#[async_trait]
impl Capability for ApiExtractor {
    fn name(&self) -> &str {
        "extract_from_api"
    }

    fn description(&self) -> &str {
        "Fetch data from a REST endpoint (GET or POST)"
    }

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Extractor
    }

    fn shape(&self) -> CapabilityShape {
        CapabilityShape::source_extractor()
    }

    async fn invoke(&self, input: Value) -> Result<Value, CapabilityError> {
        let source = SourceInput::from_value(&input)?;
        let method = source.meta_str("method").unwrap_or("GET").to_uppercase();

        let mut request = match method.as_str() {
            "GET" => self.client.get(&source.location),
            "POST" => self.client.post(&source.location),
            other => {
                return Err(CapabilityError::InvalidInput(format!(
                    "unsupported HTTP method '{}'",
                    other
                )))
            }
        };

        if let Some(headers) = source.metadata.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                request = request.header(name.as_str(), super::rows::display_value(value));
            }
        }
        if let Some(params) = source.metadata.get("params").and_then(Value::as_object) {
            let pairs: Vec<(String, String)> = params
                .iter()
                .map(|(k, v)| (k.clone(), super::rows::display_value(v)))
                .collect();
            request = request.query(&pairs);
        }
        if let Some(body) = source.metadata.get("body").filter(|b| !b.is_null()) {
            request = request.json(body);
        }
        if let Some(auth) = source.metadata.get("auth").and_then(Value::as_object) {
            match auth.get("type").and_then(Value::as_str) {
                Some("bearer") => {
                    let token = auth.get("token").and_then(Value::as_str).unwrap_or_default();
                    request = request.bearer_auth(token);
                }
                Some("basic") => {
                    let user = auth.get("user").and_then(Value::as_str).unwrap_or_default();
                    let pass = auth.get("pass").and_then(Value::as_str);
                    request = request.basic_auth(user, pass);
                }
                _ => {}
            }
        }

        let response = request.timeout(HTTP_TIMEOUT).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CapabilityError::ResourceNotFound(source.location.clone()));
        }
        let response = response.error_for_status()?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let data = if content_type.contains("application/json") {
            response.json::<Value>().await?
        } else {
            Value::String(response.text().await?)
        };

        Ok(json!({
            "format": "api",
            "url": source.location,
            "method": method,
            "status_code": status.as_u16(),
            "content_type": content_type,
            "data": data,
        }))
    }
}

// ============================================================================
// Web
// ============================================================================

/// Fetches a public page and returns its title, visible text and tables.
#[derive(Debug, Clone)]
pub struct WebExtractor {
    client: Client,
}

impl WebExtractor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Default for WebExtractor {
    fn default() -> Self {
        Self::new(http_client())
    }
}

#[async_trait]
impl Capability for WebExtractor {
    fn name(&self) -> &str {
        "extract_from_web"
    }

    fn description(&self) -> &str {
        "Scrape title, visible text and tables from a web page"
    }

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Extractor
    }

    fn shape(&self) -> CapabilityShape {
        CapabilityShape::source_extractor()
    }

    async fn invoke(&self, input: Value) -> Result<Value, CapabilityError> {
        let source = SourceInput::from_value(&input)?;
        let response = self
            .client
            .get(&source.location)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CapabilityError::ResourceNotFound(source.location.clone()));
        }
        let html = response.error_for_status()?.text().await?;

        let extract_tables = source
            .metadata
            .get("extract_tables")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let text = html_to_text(&html)?;
        let mut payload = json!({
            "format": "web",
            "url": source.location,
            "title": html_title(&html)?,
            "text": crate::utils::truncate_chars(&text, WEB_TEXT_LIMIT),
        });
        if extract_tables {
            payload["tables"] = json!(html_tables(&html)?);
        }
        Ok(payload)
    }
}

fn http_client() -> Client {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn pattern(re: &str) -> Result<Regex, CapabilityError> {
    Regex::new(re).map_err(|e| CapabilityError::Execution(format!("invalid pattern: {}", e)))
}

/// Page title, or an empty string.
pub fn html_title(html: &str) -> Result<String, CapabilityError> {
    let re = pattern(r"(?is)<title[^>]*>(.*?)</title>")?;
    Ok(re
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| decode_entities(m.as_str().trim()))
        .unwrap_or_default())
}

/// Visible text of an HTML document, one block per line.
pub fn html_to_text(html: &str) -> Result<String, CapabilityError> {
    let hidden = pattern(r"(?is)<(script|style|noscript|head)[^>]*>.*?</(script|style|noscript|head)>")?;
    let breaks = pattern(r"(?i)<(br|/p|/div|/li|/tr|/h[1-6]|/table)[^>]*>")?;
    let tags = pattern(r"(?s)<[^>]+>")?;

    let without_hidden = hidden.replace_all(html, " ");
    let with_breaks = breaks.replace_all(&without_hidden, "\n");
    let stripped = tags.replace_all(&with_breaks, " ");

    let lines: Vec<String> = stripped
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .map(|line| decode_entities(&line))
        .collect();
    Ok(lines.join("\n"))
}

/// Cells of every `<table>` in the document.
pub fn html_tables(html: &str) -> Result<Vec<Vec<Vec<String>>>, CapabilityError> {
    let table_re = pattern(r"(?is)<table[^>]*>(.*?)</table>")?;
    let row_re = pattern(r"(?is)<tr[^>]*>(.*?)</tr>")?;
    let cell_re = pattern(r"(?is)<t[dh][^>]*>(.*?)</t[dh]>")?;
    let tag_re = pattern(r"(?s)<[^>]+>")?;

    let mut tables = Vec::new();
    for table in table_re.captures_iter(html) {
        let body = table.get(1).map(|m| m.as_str()).unwrap_or_default();
        let mut rows = Vec::new();
        for row in row_re.captures_iter(body) {
            let row_body = row.get(1).map(|m| m.as_str()).unwrap_or_default();
            let cells: Vec<String> = cell_re
                .captures_iter(row_body)
                .filter_map(|c| c.get(1))
                .map(|m| {
                    let text = tag_re.replace_all(m.as_str(), " ");
                    decode_entities(&text.split_whitespace().collect::<Vec<_>>().join(" "))
                })
                .collect();
            if !cells.is_empty() {
                rows.push(cells);
            }
        }
        if !rows.is_empty() {
            tables.push(rows);
        }
    }
    Ok(tables)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source(location: &str, format: Option<&str>) -> Value {
        json!({
            "id": "s1",
            "kind": "file",
            "location": location,
            "format": format,
            "metadata": {},
        })
    }

    #[test]
    fn test_parse_csv_quoting() {
        let text = "name,amount,note\r\n\"Smith, J\",12,\"said \"\"hi\"\"\"\nDoe,3.5,\n";
        let (columns, rows) = parse_csv(text).expect("parse");
        assert_eq!(columns, vec!["name", "amount", "note"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "Smith, J");
        assert_eq!(rows[0]["amount"], 12);
        assert_eq!(rows[0]["note"], "said \"hi\"");
        assert_eq!(rows[1]["amount"], 3.5);
        assert_eq!(rows[1]["note"], Value::Null);
    }

    #[test]
    fn test_parse_csv_ragged_rows() {
        let (columns, rows) = parse_csv("a, b ,c\n1\n\n2,3,4,5\n").expect("parse");
        assert_eq!(columns, vec!["a", "b", "c"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["a"], 1);
        assert_eq!(rows[0]["c"], Value::Null);
        assert_eq!(rows[1]["c"], 4);
        assert_eq!(rows[1].len(), 3);

        let (columns, rows) = parse_csv("").expect("empty");
        assert!(columns.is_empty() && rows.is_empty());
    }

    #[test]
    fn test_effective_format() {
        assert_eq!(effective_file_format("/d/x.CSV", None).as_deref(), Some("csv"));
        assert_eq!(effective_file_format("/d/x.csv", Some("XML")).as_deref(), Some("xml"));
        assert_eq!(effective_file_format("/d/noext", None), None);
        assert!(is_supported_file_format("md"));
        assert!(!is_supported_file_format("xml"));
    }

    #[tokio::test]
    async fn test_file_extractor_csv() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("sales.csv");
        std::fs::write(&path, "region,revenue\nnorth,100\nsouth,80\n").expect("write");

        let output = FileExtractor
            .invoke(source(path.to_str().expect("utf8"), None))
            .await
            .expect("extract");
        assert_eq!(output["format"], "csv");
        assert_eq!(output["row_count"], 2);
        assert_eq!(output["rows"][1]["revenue"], 80);
    }

    #[tokio::test]
    async fn test_file_extractor_json_and_html() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let json_path = dir.path().join("data.json");
        std::fs::write(&json_path, r#"[{"a": 1}, {"a": 2}]"#).expect("write");
        let html_path = dir.path().join("page.html");
        std::fs::write(&html_path, "<html><head><title>T</title></head><body><p>Hello &amp; bye</p><script>x()</script></body></html>").expect("write");

        let json_out = FileExtractor
            .invoke(source(json_path.to_str().expect("utf8"), None))
            .await
            .expect("json");
        assert_eq!(json_out["count"], 2);

        let html_out = FileExtractor
            .invoke(source(html_path.to_str().expect("utf8"), None))
            .await
            .expect("html");
        assert_eq!(html_out["content"], "Hello & bye");
    }

    #[tokio::test]
    async fn test_file_extractor_unknown_format_reads_text() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("report.xml");
        std::fs::write(&path, "<r><v>1</v></r>").expect("write");

        let output = FileExtractor
            .invoke(source(path.to_str().expect("utf8"), Some("xml")))
            .await
            .expect("extract");
        assert_eq!(output["format"], "unknown");
        assert_eq!(output["declared_format"], "xml");
    }

    #[tokio::test]
    async fn test_file_extractor_missing_file() {
        let err = FileExtractor
            .invoke(source("/definitely/not/here.csv", None))
            .await
            .expect_err("missing");
        assert!(matches!(err, CapabilityError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_database_extractor_sqlite() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("kpi.db");
        let options = SqliteConnectOptions::new().filename(&path).create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await.expect("connect");
        sqlx::query("CREATE TABLE kpi (name TEXT, value REAL, qty INTEGER)")
            .execute(&pool)
            .await
            .expect("create");
        sqlx::query("INSERT INTO kpi VALUES ('uptime', 99.5, 3), ('latency', NULL, 7)")
            .execute(&pool)
            .await
            .expect("insert");
        pool.close().await;

        let input = json!({
            "id": "db",
            "kind": "database",
            "location": path.to_str().expect("utf8"),
            "metadata": {"table": "kpi"},
        });
        let output = DatabaseExtractor.invoke(input).await.expect("query");
        assert_eq!(output["count"], 2);
        assert_eq!(output["rows"][0]["name"], "uptime");
        assert_eq!(output["rows"][0]["qty"], 3);
        assert_eq!(output["rows"][1]["value"], Value::Null);
    }

    #[test]
    fn test_database_query_requires_query_or_table() {
        let src = SourceInput::from_value(&json!({"location": "x.db", "metadata": {}})).expect("src");
        assert!(database_query(&src).is_err());

        let src = SourceInput::from_value(&json!({"location": "x.db", "metadata": {"table": "t; DROP"}}))
            .expect("src");
        assert!(database_query(&src).is_err());
    }

    #[test]
    fn test_html_tables() {
        let html = "<table><tr><th>KPI</th><th>Value</th></tr><tr><td>Uptime</td><td><b>99%</b></td></tr></table>";
        let tables = html_tables(html).expect("tables");
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0][1], vec!["Uptime", "99%"]);
    }

    #[test]
    fn test_html_title() {
        assert_eq!(html_title("<TITLE> Q3 &amp; Q4 </TITLE>").expect("title"), "Q3 & Q4");
        assert_eq!(html_title("<p>none</p>").expect("title"), "");
    }
}
