//! Page automation contract used by the harvester, plus a form-emulating HTTP driver.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "tradestat-driver";

/// One table row keyed by header text.
pub type TableRow = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigateOptions {
    pub timeout: Duration,
}

impl Default for NavigateOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },
    #[error("no element matches {0}")]
    ElementNotFound(String),
    #[error("invalid selector {0}")]
    InvalidSelector(String),
    #[error("element {0} is not inside a form")]
    NoForm(String),
    #[error("no page loaded")]
    NoPage,
    #[error("session closed")]
    SessionClosed,
    #[error("failed to start browsing session: {0}")]
    Launch(String),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// A browsing session on the remote portal. Every call is a suspension point.
#[async_trait]
pub trait PageDriver: Send {
    async fn navigate(&mut self, url: &str, options: NavigateOptions) -> Result<(), DriverError>;

    async fn select_form_field(&mut self, field_id: &str, value: &str) -> Result<(), DriverError>;

    async fn click(&mut self, element_id: &str) -> Result<(), DriverError>;

    async fn click_and_await_navigation(
        &mut self,
        button_id: &str,
        options: NavigateOptions,
    ) -> Result<(), DriverError>;

    async fn wait_for_element(&mut self, selector: &str, timeout: Duration) -> Result<(), DriverError>;

    async fn extract_table(&mut self) -> Result<Vec<TableRow>, DriverError>;

    /// Text following `marker` in the first label element that contains it.
    async fn extract_label(&mut self, marker: &str) -> Result<Option<String>, DriverError>;

    async fn close(&mut self) -> Result<(), DriverError>;
}

/// Opens browsing sessions. Each harvest owns the session it opens.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PageDriver>, DriverError>;
}

#[derive(Debug, Clone)]
pub struct HttpSessionConfig {
    pub request_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpSessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            user_agent: None,
        }
    }
}

/// Launches [`HttpPageDriver`] sessions, each with its own cookie jar.
#[derive(Debug, Clone, Default)]
pub struct HttpSessionLauncher {
    config: HttpSessionConfig,
}

impl HttpSessionLauncher {
    pub fn new(config: HttpSessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionLauncher for HttpSessionLauncher {
    async fn open(&self) -> Result<Box<dyn PageDriver>, DriverError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .timeout(self.config.request_timeout);
        if let Some(user_agent) = &self.config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder
            .build()
            .map_err(|e| DriverError::Launch(e.to_string()))?;
        Ok(Box::new(HttpPageDriver::new(client)))
    }
}

#[derive(Debug, Clone)]
struct LoadedPage {
    url: Url,
    html: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FormSubmission {
    method: Method,
    action: Url,
    fields: Vec<(String, String)>,
}

/// Drives server-rendered HTML forms over plain HTTP.
///
/// Field selections are recorded against the current page and sent when a submit button is
/// clicked. Documents are complete once navigation resolves, so waits only check presence.
#[derive(Debug)]
pub struct HttpPageDriver {
    client: reqwest::Client,
    page: Option<LoadedPage>,
    pending: Vec<(String, String)>,
    closed: bool,
}

impl HttpPageDriver {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            page: None,
            pending: Vec::new(),
            closed: false,
        }
    }

    fn current(&self) -> Result<&LoadedPage, DriverError> {
        if self.closed {
            return Err(DriverError::SessionClosed);
        }
        self.page.as_ref().ok_or(DriverError::NoPage)
    }

    fn record_field(&mut self, name: String, value: String) {
        self.pending.retain(|(n, _)| *n != name);
        self.pending.push((name, value));
    }

    async fn load(&mut self, request: reqwest::RequestBuilder, url: &str, options: NavigateOptions) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::SessionClosed);
        }
        let response = tokio::time::timeout(options.timeout, request.send())
            .await
            .map_err(|_| DriverError::Timeout {
                what: format!("navigation to {url}"),
                after: options.timeout,
            })?
            .map_err(|e| DriverError::Navigation {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let final_url = response.url().clone();
        if !status.is_success() {
            return Err(DriverError::HttpStatus {
                status: status.as_u16(),
                url: final_url.to_string(),
            });
        }
        let html = response.text().await?;
        debug!(url = %final_url, bytes = html.len(), "page loaded");
        self.page = Some(LoadedPage {
            url: final_url,
            html,
        });
        self.pending.clear();
        Ok(())
    }
}

#[async_trait]
impl PageDriver for HttpPageDriver {
    async fn navigate(&mut self, url: &str, options: NavigateOptions) -> Result<(), DriverError> {
        let request = self.client.get(url);
        self.load(request, url, options).await
    }

    async fn select_form_field(&mut self, field_id: &str, value: &str) -> Result<(), DriverError> {
        let name = {
            let page = self.current()?;
            let document = Html::parse_document(&page.html);
            let element = element_by_id(&document, field_id)?;
            element.value().attr("name").unwrap_or(field_id).to_string()
        };
        self.record_field(name, value.to_string());
        Ok(())
    }

    async fn click(&mut self, element_id: &str) -> Result<(), DriverError> {
        let selection = {
            let page = self.current()?;
            let document = Html::parse_document(&page.html);
            let element = element_by_id(&document, element_id)?;
            checkable_value(element)
        };
        match selection {
            Some((name, value)) => self.record_field(name, value),
            None => debug!(element_id, "click has no form effect"),
        }
        Ok(())
    }

    async fn click_and_await_navigation(
        &mut self,
        button_id: &str,
        options: NavigateOptions,
    ) -> Result<(), DriverError> {
        let submission = {
            let page = self.current()?;
            build_submission(&page.html, &page.url, button_id, &self.pending)?
        };
        let url = submission.action.to_string();
        let request = if submission.method == Method::POST {
            self.client.post(submission.action).form(&submission.fields)
        } else {
            self.client.get(submission.action).query(&submission.fields)
        };
        self.load(request, &url, options).await
    }

    async fn wait_for_element(&mut self, selector: &str, _timeout: Duration) -> Result<(), DriverError> {
        let page = self.current()?;
        let document = Html::parse_document(&page.html);
        let sel = parse_selector(selector)?;
        if document.select(&sel).next().is_some() {
            Ok(())
        } else {
            Err(DriverError::ElementNotFound(selector.to_string()))
        }
    }

    async fn extract_table(&mut self) -> Result<Vec<TableRow>, DriverError> {
        let page = self.current()?;
        parse_table(&page.html)
    }

    async fn extract_label(&mut self, marker: &str) -> Result<Option<String>, DriverError> {
        let page = self.current()?;
        Ok(find_label(&page.html, marker))
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.page = None;
        self.pending.clear();
        self.closed = true;
        Ok(())
    }
}

fn parse_selector(selector: &str) -> Result<Selector, DriverError> {
    Selector::parse(selector).map_err(|e| DriverError::InvalidSelector(format!("{selector}: {e}")))
}

fn element_by_id<'a>(document: &'a Html, id: &str) -> Result<ElementRef<'a>, DriverError> {
    let sel = parse_selector(&format!("[id=\"{id}\"]"))?;
    document
        .select(&sel)
        .next()
        .ok_or_else(|| DriverError::ElementNotFound(format!("#{id}")))
}

fn cell_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn checkable_value(element: ElementRef<'_>) -> Option<(String, String)> {
    let el = element.value();
    if el.name() != "input" {
        return None;
    }
    let kind = el.attr("type").unwrap_or("text").to_ascii_lowercase();
    if kind != "radio" && kind != "checkbox" {
        return None;
    }
    let name = el.attr("name")?;
    Some((name.to_string(), el.attr("value").unwrap_or("on").to_string()))
}

/// Rows of the first table, keyed by its `th` header texts. Rows without data cells are skipped.
pub fn parse_table(html: &str) -> Result<Vec<TableRow>, DriverError> {
    let document = Html::parse_document(html);
    let table_sel = parse_selector("table")?;
    let th_sel = parse_selector("th")?;
    let row_sel = parse_selector("tbody tr")?;
    let td_sel = parse_selector("td")?;

    let Some(table) = document.select(&table_sel).next() else {
        return Ok(Vec::new());
    };
    let headers: Vec<String> = table.select(&th_sel).map(cell_text).collect();

    let rows = table
        .select(&row_sel)
        .filter_map(|tr| {
            let cells: Vec<String> = tr.select(&td_sel).map(cell_text).collect();
            if cells.is_empty() {
                return None;
            }
            Some(
                headers
                    .iter()
                    .enumerate()
                    .map(|(idx, header)| (header.clone(), cells.get(idx).cloned().unwrap_or_default()))
                    .collect::<TableRow>(),
            )
        })
        .collect();
    Ok(rows)
}

/// Finds the first `font` element containing `marker` and returns the rest of its text.
pub fn find_label(html: &str, marker: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let sel = Selector::parse("font").ok()?;
    document
        .select(&sel)
        .map(|el| el.text().collect::<String>())
        .find(|text| text.contains(marker))
        .map(|text| text.replace(marker, "").trim().to_string())
}

fn build_submission(
    html: &str,
    base: &Url,
    button_id: &str,
    overrides: &[(String, String)],
) -> Result<FormSubmission, DriverError> {
    let document = Html::parse_document(html);
    let button = element_by_id(&document, button_id)?;
    let form = button
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "form")
        .ok_or_else(|| DriverError::NoForm(button_id.to_string()))?;

    let field_sel = parse_selector("input, select, textarea")?;
    let option_sel = parse_selector("option")?;
    let mut fields: Vec<(String, String)> = Vec::new();

    for field in form.select(&field_sel) {
        let el = field.value();
        let Some(name) = el.attr("name") else {
            continue;
        };
        match el.name() {
            "input" => {
                let kind = el.attr("type").unwrap_or("text").to_ascii_lowercase();
                match kind.as_str() {
                    "submit" | "button" | "image" | "reset" | "file" => {}
                    "radio" | "checkbox" => {
                        if el.attr("checked").is_some() {
                            fields.push((name.to_string(), el.attr("value").unwrap_or("on").to_string()));
                        }
                    }
                    _ => fields.push((name.to_string(), el.attr("value").unwrap_or("").to_string())),
                }
            }
            "select" => {
                let options: Vec<ElementRef<'_>> = field.select(&option_sel).collect();
                let chosen = options
                    .iter()
                    .find(|o| o.value().attr("selected").is_some())
                    .or_else(|| options.first());
                if let Some(option) = chosen {
                    let value = option
                        .value()
                        .attr("value")
                        .map(ToString::to_string)
                        .unwrap_or_else(|| cell_text(*option));
                    fields.push((name.to_string(), value));
                }
            }
            _ => fields.push((name.to_string(), field.text().collect())),
        }
    }

    for (name, value) in overrides {
        fields.retain(|(n, _)| n != name);
        fields.push((name.clone(), value.clone()));
    }
    if let Some(name) = button.value().attr("name") {
        fields.push((
            name.to_string(),
            button.value().attr("value").unwrap_or("").to_string(),
        ));
    }

    let action = form.value().attr("action").unwrap_or("");
    let action = base
        .join(action)
        .map_err(|e| DriverError::Navigation {
            url: action.to_string(),
            message: e.to_string(),
        })?;
    let method = match form.value().attr("method") {
        Some(m) if m.eq_ignore_ascii_case("post") => Method::POST,
        _ => Method::GET,
    };

    Ok(FormSubmission {
        method,
        action,
        fields,
    })
}
