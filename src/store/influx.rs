use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use super::{Point, Store};
use crate::config::InfluxConfig;

/// InfluxDB 1.x HTTP API client.
///
/// Speaks `/query` for database provisioning and `/write` (line protocol,
/// nanosecond precision) for points.
pub struct InfluxStore {
    cfg: InfluxConfig,
    base_url: String,
    http: Option<reqwest::Client>,
    /// Database selected by `ensure_ready`.
    active_db: Option<String>,
}

impl InfluxStore {
    /// Creates a new store client. No request is made until `ensure_ready`.
    pub fn new(cfg: InfluxConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            base_url: cfg.base_url(),
            cfg,
            http: Some(http),
            active_db: None,
        })
    }

    /// Returns the database writes go to, once selected.
    pub fn active_database(&self) -> Option<&str> {
        self.active_db.as_deref()
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.http.is_none()
    }

    fn client(&self) -> Result<&reqwest::Client> {
        self.http.as_ref().context("InfluxDB connection is closed")
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.cfg.dbuser.is_empty() {
            request
        } else {
            request.basic_auth(&self.cfg.dbuser, Some(&self.cfg.dbpass))
        }
    }

    /// Runs an InfluxQL statement. Reads use GET, everything else POST.
    async fn query(&self, statement: &str, read_only: bool) -> Result<QueryResponse> {
        let client = self.client()?;
        let url = format!("{}/query", self.base_url);

        let request = if read_only {
            client.get(&url)
        } else {
            client.post(&url)
        };

        let response = self
            .authorize(request)
            .query(&[("q", statement)])
            .send()
            .await
            .with_context(|| format!("requesting {statement:?}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} for {statement:?}: {body}");
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .with_context(|| format!("decoding response to {statement:?}"))?;

        parsed.check().with_context(|| format!("executing {statement:?}"))?;

        Ok(parsed)
    }
}

impl Store for InfluxStore {
    async fn ensure_ready(&mut self) -> Result<()> {
        let name = self.cfg.dbname.clone();

        let existing = self
            .query("SHOW DATABASES", true)
            .await
            .context("listing databases")?
            .database_names();

        if existing.iter().any(|db| *db == name) {
            debug!(database = %name, "database exists");
        } else {
            self.query(&format!("CREATE DATABASE {}", quote_ident(&name)), false)
                .await
                .with_context(|| format!("creating database {name}"))?;
            info!(database = %name, "created database");
        }

        self.active_db = Some(name);

        Ok(())
    }

    async fn write(&mut self, point: &Point) -> Result<()> {
        let db = self
            .active_db
            .as_deref()
            .context("no database selected, ensure_ready must run first")?;

        let client = self.client()?;
        let body = point.to_line_protocol();

        let request = client
            .post(format!("{}/write", self.base_url))
            .query(&[("db", db), ("precision", "ns")])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body);

        let response = self
            .authorize(request)
            .send()
            .await
            .context("sending write request")?;

        let status = response.status();
        // Drain body for connection reuse.
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            bail!("write rejected with status {status}: {}", body.trim());
        }

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.http.take().is_some() {
            debug!(endpoint = %self.base_url, "InfluxDB connection closed");
        }
        self.active_db = None;

        Ok(())
    }
}

// --- JSON response structures ---

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Series {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl QueryResponse {
    /// Fails if the response or any statement carries an error.
    fn check(&self) -> Result<()> {
        if let Some(err) = &self.error {
            bail!("InfluxDB error: {err}");
        }

        for result in &self.results {
            if let Some(err) = &result.error {
                bail!("InfluxDB statement error: {err}");
            }
        }

        Ok(())
    }

    /// Extracts the first column of every row, as returned by `SHOW DATABASES`.
    fn database_names(&self) -> Vec<String> {
        self.results
            .iter()
            .flat_map(|r| &r.series)
            .flat_map(|s| &s.values)
            .filter_map(|row| row.first())
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect()
    }
}

/// Quotes an InfluxQL identifier.
fn quote_ident(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for c in name.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
