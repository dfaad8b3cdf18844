use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use tradestat_core::{ConsolidatedRecord, Consolidator, ExtractedRow, HarvestRequest, YearWindow, UNKNOWN_COUNTRY};
use tradestat_driver::{DriverError, NavigateOptions, PageDriver, SessionLauncher};

use crate::{HarvestConfig, HarvestError};

/// Outcome of one suspension point.
#[derive(Debug)]
enum StepError {
    Cancelled,
    Failed(DriverError),
}

/// Races `fut` against cancellation and bounds it by `limit`.
async fn step<T>(
    token: &CancellationToken,
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T, DriverError>>,
) -> Result<T, StepError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(StepError::Cancelled),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(StepError::Failed(err)),
            Err(_) => Err(StepError::Failed(DriverError::Timeout {
                what: what.to_string(),
                after: limit,
            })),
        },
    }
}

fn checkpoint(token: &CancellationToken) -> Result<(), StepError> {
    if token.is_cancelled() {
        Err(StepError::Cancelled)
    } else {
        Ok(())
    }
}

/// Drives the portal once per year window and consolidates the matching rows.
pub struct HarvestOrchestrator {
    config: HarvestConfig,
    launcher: Arc<dyn SessionLauncher>,
}

impl HarvestOrchestrator {
    pub fn new(config: HarvestConfig, launcher: Arc<dyn SessionLauncher>) -> Self {
        Self { config, launcher }
    }

    /// Runs a full harvest. The browsing session is closed on every exit path.
    pub async fn harvest(
        &self,
        request: &HarvestRequest,
        token: &CancellationToken,
    ) -> Result<Vec<ConsolidatedRecord>, HarvestError> {
        let span = info_span!(
            "harvest",
            operation_id = %request.operation_id,
            country = %request.country_code,
            code = %request.requested_code,
            level = %request.hs_level,
        );

        async {
            let mut session = self.launcher.open().await.map_err(HarvestError::Session)?;
            let outcome = self.drive(session.as_mut(), request, token).await;
            if let Err(err) = session.close().await {
                warn!(error = %err, "failed to close browsing session");
            }
            match &outcome {
                Ok(records) => info!(records = records.len(), "harvest finished"),
                Err(err) => info!(error = %err, "harvest aborted"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        session: &mut dyn PageDriver,
        request: &HarvestRequest,
        token: &CancellationToken,
    ) -> Result<Vec<ConsolidatedRecord>, HarvestError> {
        checkpoint(token).map_err(|_| HarvestError::Cancelled)?;
        self.load_portal(session, token).await.map_err(|err| match err {
            StepError::Cancelled => HarvestError::Cancelled,
            StepError::Failed(err) => HarvestError::Navigation(err),
        })?;

        let target = request.matching_code();
        let mut consolidated = Consolidator::new();

        for window in self.config.windows() {
            checkpoint(token).map_err(|_| HarvestError::Cancelled)?;

            let label = window.label();
            let year = self
                .harvest_year(session, request, &window, token)
                .instrument(info_span!("year", window = %label))
                .await;
            match year {
                Ok(rows) => {
                    let seen = rows.len();
                    let matched = consolidated.absorb_matching(target, &window, rows);
                    debug!(window = %label, seen, matched, "year harvested");
                }
                Err(StepError::Cancelled) => return Err(HarvestError::Cancelled),
                Err(StepError::Failed(err)) => {
                    warn!(window = %label, error = %err, "skipping year");
                }
            }

            checkpoint(token).map_err(|_| HarvestError::Cancelled)?;
            match self.load_portal(session, token).await {
                Ok(()) => {}
                Err(StepError::Cancelled) => return Err(HarvestError::Cancelled),
                Err(StepError::Failed(err)) => {
                    warn!(window = %label, error = %err, "failed to reset query form");
                }
            }
        }

        if consolidated.is_empty() {
            return Err(HarvestError::NoMatch);
        }
        Ok(consolidated.into_records())
    }

    async fn load_portal(
        &self,
        session: &mut dyn PageDriver,
        token: &CancellationToken,
    ) -> Result<(), StepError> {
        let options = NavigateOptions {
            timeout: self.config.navigation_timeout,
        };
        step(
            token,
            self.config.navigation_timeout,
            "portal load",
            session.navigate(&self.config.portal_url, options),
        )
        .await
    }

    async fn harvest_year(
        &self,
        session: &mut dyn PageDriver,
        request: &HarvestRequest,
        window: &YearWindow,
        token: &CancellationToken,
    ) -> Result<Vec<ExtractedRow>, StepError> {
        let form = &self.config.form;
        let nav_timeout = self.config.navigation_timeout;
        let options = NavigateOptions {
            timeout: nav_timeout,
        };

        let year_value = window.form_value();
        let submit = async {
            session.select_form_field(&form.year_field, &year_value).await?;
            session
                .select_form_field(&form.country_field, &request.country_code)
                .await?;
            session
                .select_form_field(&form.level_field, request.hs_level.as_str())
                .await?;
            session.click(&form.all_commodities_radio).await?;
            session
                .click_and_await_navigation(&form.submit_button, options)
                .await
        };
        step(token, nav_timeout, "form submission", submit).await?;

        checkpoint(token)?;
        let table_timeout = self.config.table_timeout;
        step(
            token,
            table_timeout,
            "result table",
            session.wait_for_element(&form.table_selector, table_timeout),
        )
        .await?;

        let country = step(
            token,
            nav_timeout,
            "country label",
            session.extract_label(&form.country_marker),
        )
        .await?
        .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());

        checkpoint(token)?;
        let table = step(token, nav_timeout, "table extraction", session.extract_table()).await?;

        Ok(table
            .iter()
            .map(|cells| ExtractedRow::from_table_row(cells, &country, window))
            .collect())
    }
}
