use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tradestat_core::HarvestRequest;
use tradestat_driver::{DriverError, NavigateOptions, PageDriver, SessionLauncher, TableRow};
use tradestat_harvest::{
    harvest_and_store, HarvestConfig, HarvestError, HarvestOrchestrator, HarvestService,
    OperationRegistry, RegistryError,
};
use tradestat_storage::ResultStore;

#[derive(Clone)]
enum YearScript {
    Rows(Vec<TableRow>),
    FailSubmit,
    Hang,
}

#[derive(Default)]
struct PortalLog {
    sessions_opened: usize,
    sessions_closed: usize,
    navigations: usize,
    submitted_years: Vec<String>,
    submitted_levels: Vec<String>,
}

#[derive(Clone)]
struct ScriptedPortal {
    years: HashMap<String, YearScript>,
    /// 1-based navigation attempts that fail; the first one is the initial portal load.
    failing_navigations: Vec<usize>,
    log: Arc<Mutex<PortalLog>>,
    hanging: Arc<Notify>,
}

impl ScriptedPortal {
    fn new() -> Self {
        Self {
            years: HashMap::new(),
            failing_navigations: Vec::new(),
            log: Arc::new(Mutex::new(PortalLog::default())),
            hanging: Arc::new(Notify::new()),
        }
    }

    fn year(mut self, year: i32, script: YearScript) -> Self {
        self.years.insert(year.to_string(), script);
        self
    }

    fn every_year(mut self, script: YearScript) -> Self {
        for year in 2020..2025 {
            self.years.insert(year.to_string(), script.clone());
        }
        self
    }

    fn closed(&self) -> usize {
        self.log.lock().unwrap().sessions_closed
    }

    fn opened(&self) -> usize {
        self.log.lock().unwrap().sessions_opened
    }
}

struct ScriptedSession {
    portal: ScriptedPortal,
    fields: HashMap<String, String>,
    page: Option<YearScript>,
}

#[async_trait]
impl SessionLauncher for ScriptedPortal {
    async fn open(&self) -> Result<Box<dyn PageDriver>, DriverError> {
        self.log.lock().unwrap().sessions_opened += 1;
        Ok(Box::new(ScriptedSession {
            portal: self.clone(),
            fields: HashMap::new(),
            page: None,
        }))
    }
}

#[async_trait]
impl PageDriver for ScriptedSession {
    async fn navigate(&mut self, url: &str, _options: NavigateOptions) -> Result<(), DriverError> {
        let attempt = {
            let mut log = self.portal.log.lock().unwrap();
            log.navigations += 1;
            log.navigations
        };
        if self.portal.failing_navigations.contains(&attempt) {
            return Err(DriverError::Navigation {
                url: url.to_string(),
                message: "connection refused".to_string(),
            });
        }
        self.fields.clear();
        self.page = None;
        Ok(())
    }

    async fn select_form_field(&mut self, field_id: &str, value: &str) -> Result<(), DriverError> {
        self.fields.insert(field_id.to_string(), value.to_string());
        Ok(())
    }

    async fn click(&mut self, _element_id: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn click_and_await_navigation(
        &mut self,
        _button_id: &str,
        _options: NavigateOptions,
    ) -> Result<(), DriverError> {
        let year = self.fields.get("select2").cloned().unwrap_or_default();
        {
            let mut log = self.portal.log.lock().unwrap();
            log.submitted_years.push(year.clone());
            log.submitted_levels
                .push(self.fields.get("hslevel").cloned().unwrap_or_default());
        }
        match self.portal.years.get(&year).cloned() {
            Some(YearScript::FailSubmit) => Err(DriverError::Timeout {
                what: "form submission".to_string(),
                after: Duration::from_secs(60),
            }),
            Some(YearScript::Hang) => {
                self.portal.hanging.notify_one();
                std::future::pending::<()>().await;
                Ok(())
            }
            Some(script) => {
                self.page = Some(script);
                Ok(())
            }
            None => {
                self.page = Some(YearScript::Rows(Vec::new()));
                Ok(())
            }
        }
    }

    async fn wait_for_element(&mut self, selector: &str, _timeout: Duration) -> Result<(), DriverError> {
        match self.page {
            Some(_) => Ok(()),
            None => Err(DriverError::ElementNotFound(selector.to_string())),
        }
    }

    async fn extract_table(&mut self) -> Result<Vec<TableRow>, DriverError> {
        match &self.page {
            Some(YearScript::Rows(rows)) => Ok(rows.clone()),
            _ => Err(DriverError::NoPage),
        }
    }

    async fn extract_label(&mut self, _marker: &str) -> Result<Option<String>, DriverError> {
        Ok(Some("INDONESIA".to_string()))
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.portal.log.lock().unwrap().sessions_closed += 1;
        Ok(())
    }
}

fn row(code: &str, commodity: &str, year_label: &str, value: &str) -> TableRow {
    BTreeMap::from([
        ("HSCode".to_string(), code.to_string()),
        ("Commodity".to_string(), commodity.to_string()),
        (year_label.to_string(), value.to_string()),
    ])
}

fn year_rows(year: i32) -> YearScript {
    let label = format!("{}-{}", year, year + 1);
    let mut rows = vec![
        row("0302.11", "TROUT", &label, &format!("{year}.11")),
        row("0304.71", "COD FILLETS", &label, "9.99"),
    ];
    if year == 2024 {
        rows[0].insert("2024-2025(Apr-Dec)".to_string(), "0.5".to_string());
    }
    YearScript::Rows(rows)
}

fn config() -> HarvestConfig {
    with_timeouts(Duration::from_secs(5))
}

fn with_timeouts(limit: Duration) -> HarvestConfig {
    HarvestConfig {
        portal_url: "https://portal.test/eidb/ecntcomq.asp".to_string(),
        navigation_timeout: limit,
        table_timeout: limit,
        ..HarvestConfig::default()
    }
}

fn orchestrator(portal: &ScriptedPortal) -> HarvestOrchestrator {
    HarvestOrchestrator::new(config(), Arc::new(portal.clone()))
}

fn all_years(portal: ScriptedPortal) -> ScriptedPortal {
    (2020..2025).fold(portal, |p, y| p.year(y, year_rows(y)))
}

#[tokio::test]
async fn consolidates_matching_rows_across_years() {
    let portal = all_years(ScriptedPortal::new());
    let request = HarvestRequest::new("42", "0302", "6");

    let records = orchestrator(&portal)
        .harvest(&request, &CancellationToken::new())
        .await
        .expect("harvest");

    assert_eq!(records.len(), 1);
    let trout = &records[0];
    assert_eq!(trout.hs_code, "030211");
    assert_eq!(trout.country, "INDONESIA");
    for year in 2020..2025 {
        let label = format!("{}-{}", year, year + 1);
        assert_eq!(trout.value_for(&label), Some(format!("{year}.11").as_str()));
    }
    assert_eq!(trout.value_for("2024-2025(Apr-Dec)"), Some("0.5"));

    let log = portal.log.lock().unwrap();
    assert_eq!(log.submitted_years, vec!["2020", "2021", "2022", "2023", "2024"]);
    assert!(log.submitted_levels.iter().all(|l| l == "6"));
    assert_eq!(log.sessions_closed, 1);
}

#[tokio::test]
async fn failed_year_is_skipped_and_others_survive() {
    let portal = all_years(ScriptedPortal::new()).year(2022, YearScript::FailSubmit);
    let request = HarvestRequest::new("42", "0302", "6");

    let records = orchestrator(&portal)
        .harvest(&request, &CancellationToken::new())
        .await
        .expect("harvest");

    let trout = &records[0];
    assert_eq!(trout.value_for("2022-2023"), None);
    assert_eq!(trout.value_for("2021-2022"), Some("2021.11"));
    assert_eq!(trout.value_for("2023-2024"), Some("2023.11"));
    assert_eq!(portal.closed(), 1);
}

#[tokio::test]
async fn year_that_never_answers_times_out_and_is_skipped() {
    let portal = all_years(ScriptedPortal::new()).year(2022, YearScript::Hang);
    let orchestrator =
        HarvestOrchestrator::new(with_timeouts(Duration::from_millis(30)), Arc::new(portal.clone()));
    let request = HarvestRequest::new("42", "0302", "6");

    let records = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.harvest(&request, &CancellationToken::new()),
    )
    .await
    .expect("bounded by the navigation timeout")
    .expect("harvest");

    let trout = &records[0];
    assert_eq!(trout.value_for("2022-2023"), None);
    for year in [2020, 2021, 2023, 2024] {
        let label = format!("{}-{}", year, year + 1);
        assert_eq!(trout.value_for(&label), Some(format!("{year}.11").as_str()));
    }
    assert_eq!(portal.closed(), 1);
}

#[tokio::test]
async fn failed_form_reset_does_not_stop_the_harvest() {
    let mut portal = all_years(ScriptedPortal::new());
    // attempt 3 is the reset after the 2021 window
    portal.failing_navigations = vec![3];
    let request = HarvestRequest::new("42", "0302", "6");

    let records = orchestrator(&portal)
        .harvest(&request, &CancellationToken::new())
        .await
        .expect("harvest");

    let trout = &records[0];
    for year in 2020..2025 {
        let label = format!("{}-{}", year, year + 1);
        assert_eq!(trout.value_for(&label), Some(format!("{year}.11").as_str()));
    }
    let log = portal.log.lock().unwrap();
    assert_eq!(log.navigations, 6);
    assert_eq!(log.submitted_years, vec!["2020", "2021", "2022", "2023", "2024"]);
    assert_eq!(log.sessions_closed, 1);
}

#[tokio::test]
async fn odd_length_code_matches_truncated_but_saves_under_requested_code() {
    let portal = all_years(ScriptedPortal::new());
    let dir = tempdir().expect("tempdir");
    let store = ResultStore::new(dir.path());
    let request = HarvestRequest::new("42", "03021", "4");

    let saved = harvest_and_store(&orchestrator(&portal), &store, &request, &CancellationToken::new())
        .await
        .expect("harvest");

    assert!(saved.path.ends_with("42_03021.json"));
    assert_eq!(saved.records, 1);
}

#[tokio::test]
async fn no_matching_rows_fails_without_writing() {
    let portal = all_years(ScriptedPortal::new());
    let dir = tempdir().expect("tempdir");
    let store = ResultStore::new(dir.path().join("data"));
    let request = HarvestRequest::new("42", "9999", "4");

    let err = harvest_and_store(&orchestrator(&portal), &store, &request, &CancellationToken::new())
        .await
        .expect_err("no match");

    assert!(matches!(err, HarvestError::NoMatch));
    assert!(!store.artifact_path("42", "9999").exists());
    assert_eq!(portal.closed(), 1);
}

#[tokio::test]
async fn every_year_failing_is_no_match() {
    let portal = ScriptedPortal::new().every_year(YearScript::FailSubmit);
    let request = HarvestRequest::new("42", "0302", "4");

    let err = orchestrator(&portal)
        .harvest(&request, &CancellationToken::new())
        .await
        .expect_err("no match");
    assert!(matches!(err, HarvestError::NoMatch));
}

#[tokio::test]
async fn first_page_load_failure_is_fatal() {
    let mut portal = all_years(ScriptedPortal::new());
    portal.failing_navigations = vec![1];
    let request = HarvestRequest::new("42", "0302", "4");

    let err = orchestrator(&portal)
        .harvest(&request, &CancellationToken::new())
        .await
        .expect_err("navigation");
    assert!(matches!(err, HarvestError::Navigation(_)));
    assert!(portal.log.lock().unwrap().submitted_years.is_empty());
    assert_eq!(portal.closed(), 1);
}

#[tokio::test]
async fn cancel_before_first_checkpoint_releases_session_and_registry() {
    let portal = all_years(ScriptedPortal::new());
    let registry = OperationRegistry::new();
    let request = HarvestRequest::new("42", "0302", "4");
    let lease = registry.register(&request.operation_id).expect("register");

    assert!(registry.cancel(&request.operation_id));
    let err = orchestrator(&portal)
        .harvest(&request, &lease.token())
        .await
        .expect_err("cancelled");
    drop(lease);

    assert!(err.is_cancelled());
    assert_eq!(portal.opened(), portal.closed());
    assert!(!registry.cancel(&request.operation_id));
}

#[tokio::test]
async fn cancel_interrupts_a_pending_step() {
    let portal = all_years(ScriptedPortal::new()).year(2021, YearScript::Hang);
    let hanging = Arc::clone(&portal.hanging);
    let token = CancellationToken::new();
    let request = HarvestRequest::new("42", "0302", "4");

    let orchestrator = orchestrator(&portal);
    let task = {
        let token = token.clone();
        tokio::spawn(async move { orchestrator.harvest(&request, &token).await })
    };

    hanging.notified().await;
    token.cancel();
    let err = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("cancellation is prompt")
        .expect("join")
        .expect_err("cancelled");

    assert!(err.is_cancelled());
    assert_eq!(portal.closed(), 1);
    assert_eq!(portal.log.lock().unwrap().submitted_years, vec!["2020", "2021"]);
}

#[tokio::test]
async fn service_releases_operation_after_completion() {
    let portal = all_years(ScriptedPortal::new());
    let dir = tempdir().expect("tempdir");
    let service = HarvestService::new(
        Arc::new(orchestrator(&portal)),
        Arc::new(ResultStore::new(dir.path())),
        OperationRegistry::new(),
    );
    let request = HarvestRequest::new("42", "0302", "4");
    let operation_id = request.operation_id.clone();

    let running = service.start(request).expect("start");
    assert_eq!(running.operation_id(), operation_id);
    let saved = running.finish().await.expect("finish");

    assert!(saved.path.exists());
    assert!(!service.registry().cancel(&operation_id));
}

#[tokio::test]
async fn dropping_a_running_harvest_cancels_it() {
    let portal = all_years(ScriptedPortal::new()).year(2020, YearScript::Hang);
    let hanging = Arc::clone(&portal.hanging);
    let dir = tempdir().expect("tempdir");
    let service = HarvestService::new(
        Arc::new(orchestrator(&portal)),
        Arc::new(ResultStore::new(dir.path())),
        OperationRegistry::new(),
    );

    let running = service
        .start(HarvestRequest::new("42", "0302", "4"))
        .expect("start");
    hanging.notified().await;
    drop(running);

    for _ in 0..100 {
        if portal.closed() == 1 && service.registry().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(portal.closed(), 1);
    assert!(service.registry().is_empty());
}

#[tokio::test]
async fn starting_a_duplicate_operation_is_a_registry_error() {
    let portal = all_years(ScriptedPortal::new()).year(2020, YearScript::Hang);
    let hanging = Arc::clone(&portal.hanging);
    let dir = tempdir().expect("tempdir");
    let service = HarvestService::new(
        Arc::new(orchestrator(&portal)),
        Arc::new(ResultStore::new(dir.path())),
        OperationRegistry::new(),
    );
    let request = HarvestRequest::new("42", "0302", "4");

    let running = service.start(request.clone()).expect("start");
    hanging.notified().await;
    let err = service.start(request.clone()).map(|_| ()).expect_err("duplicate");
    assert_eq!(err, RegistryError::Duplicate(request.operation_id.clone()));

    drop(running);
}
