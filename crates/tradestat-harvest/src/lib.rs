//! Harvest orchestration: configuration, the per-year portal loop, and operation tracking.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::DropGuard;
use tracing::info;
use tradestat_core::{HarvestRequest, YearWindow};
use tradestat_driver::{DriverError, HttpSessionConfig, HttpSessionLauncher};
use tradestat_storage::{ResultStore, SavedArtifact, StoreError};

mod orchestrator;
mod registry;

pub use orchestrator::HarvestOrchestrator;
pub use registry::{OperationHandle, OperationLease, OperationRegistry, RegistryError};

pub const CRATE_NAME: &str = "tradestat-harvest";

pub const DEFAULT_PORTAL_URL: &str = "https://tradestat.commerce.gov.in/eidb/ecntcomq.asp";
/// Accepted range for `TRADESTAT_BASE_YEAR`; anything else falls back to the default.
pub const BASE_YEAR_RANGE: std::ops::RangeInclusive<i32> = 1900..=9999;
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Element ids and markers of the portal's query form and result page.
#[derive(Debug, Clone)]
pub struct PortalForm {
    pub year_field: String,
    pub country_field: String,
    pub level_field: String,
    pub all_commodities_radio: String,
    pub submit_button: String,
    pub table_selector: String,
    pub country_marker: String,
}

impl Default for PortalForm {
    fn default() -> Self {
        Self {
            year_field: "select2".to_string(),
            country_field: "select3".to_string(),
            level_field: "hslevel".to_string(),
            all_commodities_radio: "radioDAll".to_string(),
            submit_button: "button1".to_string(),
            table_selector: "table".to_string(),
            country_marker: "Country / Region:".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub portal_url: String,
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub navigation_timeout: Duration,
    pub table_timeout: Duration,
    pub session_timeout: Duration,
    pub base_year: i32,
    pub window_count: usize,
    pub partial_suffix: String,
    pub form: PortalForm,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            portal_url: DEFAULT_PORTAL_URL.to_string(),
            data_dir: PathBuf::from("./data"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            navigation_timeout: Duration::from_secs(60),
            table_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(120),
            base_year: 2020,
            window_count: 5,
            partial_suffix: "(Apr-Dec)".to_string(),
            form: PortalForm::default(),
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |key: &str, fallback: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };
        Self {
            portal_url: std::env::var("TRADESTAT_PORTAL_URL").unwrap_or(defaults.portal_url),
            data_dir: std::env::var("TRADESTAT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            user_agent: std::env::var("TRADESTAT_USER_AGENT").unwrap_or(defaults.user_agent),
            navigation_timeout: secs("TRADESTAT_NAV_TIMEOUT_SECS", defaults.navigation_timeout),
            table_timeout: secs("TRADESTAT_TABLE_TIMEOUT_SECS", defaults.table_timeout),
            session_timeout: secs("TRADESTAT_SESSION_TIMEOUT_SECS", defaults.session_timeout),
            base_year: std::env::var("TRADESTAT_BASE_YEAR")
                .ok()
                .and_then(|v| parse_base_year(&v))
                .unwrap_or(defaults.base_year),
            ..defaults
        }
    }

    pub fn windows(&self) -> Vec<YearWindow> {
        YearWindow::sequence(self.base_year, self.window_count, &self.partial_suffix)
    }

    pub fn session_config(&self) -> HttpSessionConfig {
        HttpSessionConfig {
            request_timeout: self.session_timeout,
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn parse_base_year(raw: &str) -> Option<i32> {
    raw.trim().parse().ok().filter(|year| BASE_YEAR_RANGE.contains(year))
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("failed to open browsing session")]
    Session(#[source] DriverError),
    #[error("portal query page did not load")]
    Navigation(#[source] DriverError),
    #[error("no matching HS codes found in any year")]
    NoMatch,
    #[error("failed to persist result artifact")]
    Store(#[from] StoreError),
    #[error("harvest task ended abnormally: {0}")]
    Task(String),
}

impl HarvestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HarvestError::Cancelled)
    }
}

/// Wires the orchestrator, the result store and the operation registry together.
#[derive(Clone)]
pub struct HarvestService {
    orchestrator: Arc<HarvestOrchestrator>,
    store: Arc<ResultStore>,
    registry: Arc<OperationRegistry>,
}

impl HarvestService {
    pub fn new(
        orchestrator: Arc<HarvestOrchestrator>,
        store: Arc<ResultStore>,
        registry: Arc<OperationRegistry>,
    ) -> Self {
        Self {
            orchestrator,
            store,
            registry,
        }
    }

    pub fn from_config(config: HarvestConfig) -> Self {
        let store = Arc::new(ResultStore::new(config.data_dir.clone()));
        let launcher = Arc::new(HttpSessionLauncher::new(config.session_config()));
        let orchestrator = Arc::new(HarvestOrchestrator::new(config, launcher));
        Self::new(orchestrator, store, OperationRegistry::new())
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// Registers the operation and runs the harvest on its own task.
    ///
    /// The registry entry is released when that task ends, whatever the outcome.
    pub fn start(&self, request: HarvestRequest) -> Result<RunningHarvest, RegistryError> {
        let lease = self.registry.register(&request.operation_id)?;
        let token = lease.token();
        let guard = token.clone().drop_guard();
        let operation_id = request.operation_id.clone();
        let orchestrator = Arc::clone(&self.orchestrator);
        let store = Arc::clone(&self.store);

        let task = tokio::spawn(async move {
            let _lease = lease;
            harvest_and_store(&orchestrator, &store, &request, &token).await
        });

        Ok(RunningHarvest {
            operation_id,
            guard: Some(guard),
            task,
        })
    }
}

/// A harvest running on its own task.
///
/// Dropping this handle before [`RunningHarvest::finish`] returns cancels the operation.
pub struct RunningHarvest {
    operation_id: String,
    guard: Option<DropGuard>,
    task: JoinHandle<Result<SavedArtifact, HarvestError>>,
}

impl RunningHarvest {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub async fn finish(mut self) -> Result<SavedArtifact, HarvestError> {
        let joined = (&mut self.task).await;
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
        match joined {
            Ok(result) => result,
            Err(err) => Err(HarvestError::Task(err.to_string())),
        }
    }
}

/// Runs one harvest and persists its records under the untruncated requested code.
pub async fn harvest_and_store(
    orchestrator: &HarvestOrchestrator,
    store: &ResultStore,
    request: &HarvestRequest,
    token: &tokio_util::sync::CancellationToken,
) -> Result<SavedArtifact, HarvestError> {
    let records = orchestrator.harvest(request, token).await?;
    let saved = store
        .save(&request.country_code, &request.requested_code, &records)
        .await?;
    info!(
        operation_id = %request.operation_id,
        path = %saved.path.display(),
        records = saved.records,
        "harvest stored"
    );
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_covers_five_windows_from_2020() {
        let config = HarvestConfig::default();
        let windows = config.windows();
        assert_eq!(windows.len(), 5);
        assert_eq!(windows[0].label(), "2020-2021");
        assert_eq!(
            windows[4].partial_label.as_deref(),
            Some("2024-2025(Apr-Dec)")
        );
    }

    #[test]
    fn session_config_carries_user_agent_and_timeout() {
        let config = HarvestConfig {
            session_timeout: Duration::from_secs(7),
            ..HarvestConfig::default()
        };
        let session = config.session_config();
        assert_eq!(session.request_timeout, Duration::from_secs(7));
        assert!(session.user_agent.is_some_and(|ua| ua.starts_with("Mozilla/5.0")));
    }

    #[test]
    fn base_year_outside_calendar_range_is_rejected() {
        assert_eq!(parse_base_year("2021"), Some(2021));
        assert_eq!(parse_base_year(" 1999 "), Some(1999));
        assert_eq!(parse_base_year("2147483647"), None);
        assert_eq!(parse_base_year("-5"), None);
        assert_eq!(parse_base_year("next"), None);
    }

    #[test]
    fn only_cancellation_reports_cancelled() {
        assert!(HarvestError::Cancelled.is_cancelled());
        assert!(!HarvestError::NoMatch.is_cancelled());
    }
}
