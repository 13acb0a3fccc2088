use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info};

use super::gates::run_gate_passes;
use super::ingest::run_filter_pass;
use super::Collaborators;
use crate::clustering::refresh_clusters;
use crate::db::Database;
use crate::environment::Settings;
use crate::keywords::KeywordFilter;
use crate::resolver::resolve_pending;
use crate::{WorkerDetail, TARGET_PIPELINE};

const IDLE_SLEEP: Duration = Duration::from_secs(10);
const ERROR_SLEEP: Duration = Duration::from_secs(5);

/// Keyword filter followed by primary resolution. Only one process should run this at a time
/// so that earlier articles always resolve first.
pub async fn run_ingest_once(db: &Database, settings: &Settings) -> Result<usize> {
    let filter = KeywordFilter::new(&settings.keywords);
    let filtered = run_filter_pass(db, &filter, settings.batch_size).await?;
    let resolved = resolve_pending(db, settings.simhash_max_distance, settings.batch_size).await?;
    Ok(filtered.checked + resolved.resolved())
}

/// Filter/resolve loop.
pub async fn ingest_loop(db: Database, settings: Settings, worker_detail: WorkerDetail) {
    info!(target: TARGET_PIPELINE, "[{} {}]: starting ingest loop.", worker_detail.name, worker_detail.id);
    if settings.keywords.is_empty() {
        info!(target: TARGET_PIPELINE, "[{} {}]: no KEYWORDS configured, nothing will pass the filter.", worker_detail.name, worker_detail.id);
    }

    loop {
        match run_ingest_once(&db, &settings).await {
            Ok(0) => {
                debug!(target: TARGET_PIPELINE, "[{} {}]: nothing to ingest, sleeping {:?}.", worker_detail.name, worker_detail.id, IDLE_SLEEP);
                sleep(IDLE_SLEEP).await;
            }
            Ok(_) => {}
            Err(e) => {
                error!(target: TARGET_PIPELINE, "[{} {}]: ingest pass failed: {:?}, sleeping {:?}.", worker_detail.name, worker_detail.id, e, ERROR_SLEEP);
                sleep(ERROR_SLEEP).await;
            }
        }
    }
}

/// Summarize and gate loop. Several of these may run side by side; the conditional writes
/// keep them from applying a transition twice.
pub async fn gate_loop(
    db: Database,
    settings: Settings,
    collaborators: Collaborators,
    worker_detail: WorkerDetail,
) {
    info!(target: TARGET_PIPELINE, "[{} {}]: starting gate loop.", worker_detail.name, worker_detail.id);

    loop {
        match run_gate_passes(&db, &settings, &collaborators).await {
            Ok(stats) if stats.did_work() => {
                debug!(target: TARGET_PIPELINE, "[{} {}]: gate passes: {:?}", worker_detail.name, worker_detail.id, stats);
            }
            Ok(_) => sleep(IDLE_SLEEP).await,
            Err(e) => {
                error!(target: TARGET_PIPELINE, "[{} {}]: gate pass failed: {:?}, sleeping {:?}.", worker_detail.name, worker_detail.id, e, ERROR_SLEEP);
                sleep(ERROR_SLEEP).await;
            }
        }
    }
}

/// Starts the ingest loop and one gate loop. `worker_concurrency` bounds the collaborator
/// calls inside each gate pass, not the number of loops.
pub fn spawn_workers(
    db: &Database,
    settings: &Settings,
    collaborators: &Collaborators,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(ingest_loop(
            db.clone(),
            settings.clone(),
            WorkerDetail::new("ingest", 0),
        )),
        tokio::spawn(gate_loop(
            db.clone(),
            settings.clone(),
            collaborators.clone(),
            WorkerDetail::new("gate", 0),
        )),
    ]
}

/// Periodic cluster cache rebuild. A refresh that finds the lock held is simply skipped.
pub async fn refresh_loop(
    db: Database,
    settings: Settings,
    collaborators: Collaborators,
    worker_detail: WorkerDetail,
) {
    info!(target: TARGET_PIPELINE, "[{} {}]: starting cluster refresh loop every {:?}.", worker_detail.name, worker_detail.id, settings.cluster_refresh_interval);

    loop {
        if let Err(e) = refresh_clusters(&db, &settings, collaborators.grouper.as_ref()).await {
            error!(target: TARGET_PIPELINE, "[{} {}]: cluster refresh failed: {:?}", worker_detail.name, worker_detail.id, e);
        }
        sleep(settings.cluster_refresh_interval).await;
    }
}
