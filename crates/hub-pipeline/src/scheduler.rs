use anyhow::{Context, Result};
use hub_core::HubError;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::HubConfig;
use crate::orchestrator::Pipeline;

/// Trigger a run for every registered source and wait for them to finish.
/// A source whose previous run is still going is skipped.
pub async fn ingest_all(pipeline: &Pipeline) -> Vec<hub_core::IngestionRun> {
    let mut handles = Vec::new();
    for source_id in pipeline.source_ids() {
        match pipeline.ingest(&source_id) {
            Ok(handle) => handles.push(handle),
            Err(HubError::RunAlreadyActive { run_id, .. }) => {
                info!(%source_id, %run_id, "previous run still active; trigger skipped")
            }
            Err(err) => warn!(%source_id, error = %err, "could not start run"),
        }
    }

    let mut finished = Vec::with_capacity(handles.len());
    for handle in handles {
        let source_id = handle.source_id().to_string();
        match handle.wait().await {
            Ok(run) => finished.push(run),
            Err(err) => warn!(%source_id, error = %err, "run task did not finish"),
        }
    }
    finished
}

/// Cron-driven ingestion, only when enabled in configuration.
pub async fn maybe_build_scheduler(pipeline: &Pipeline, config: &HubConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let pipeline = pipeline.clone();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            info!("scheduled ingestion triggered");
            let runs = ingest_all(&pipeline).await;
            for run in runs {
                info!(run_id = %run.run_id, source_id = %run.source_id, status = run.status.as_str(), "scheduled run finished");
            }
            if !pipeline.pending_reconciliation().is_empty() {
                pipeline.reconcile().await;
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::PipelineOptions;

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let pipeline = Pipeline::in_memory(PipelineOptions::default());
        let config = HubConfig::for_workspace("/srv/hub");
        assert!(maybe_build_scheduler(&pipeline, &config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enabled_scheduler_accepts_the_configured_cron() {
        let pipeline = Pipeline::in_memory(PipelineOptions::default());
        let mut config = HubConfig::for_workspace("/srv/hub");
        config.scheduler_enabled = true;
        assert!(maybe_build_scheduler(&pipeline, &config).await.unwrap().is_some());

        config.sync_cron = "not a cron".to_string();
        assert!(maybe_build_scheduler(&pipeline, &config).await.is_err());
    }

    #[tokio::test]
    async fn ingest_all_with_no_sources_is_empty() {
        let pipeline = Pipeline::in_memory(PipelineOptions::default());
        assert!(ingest_all(&pipeline).await.is_empty());
    }
}
