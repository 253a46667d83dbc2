//! Background task that drains the queue on its own.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::{DrainCancel, SyncEngine};

/// Runs drain passes when connectivity comes back, when the engine is woken,
/// and on the configured interval.
pub struct SyncWorker {
    cancel: DrainCancel,
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(engine: SyncEngine) -> Self {
        let cancel = DrainCancel::new();
        let stop = Arc::new(Notify::new());
        let handle = tokio::spawn(run(engine, cancel.clone(), Arc::clone(&stop)));
        Self {
            cancel,
            stop,
            handle,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop after the operation in flight and wait for the task to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.stop.notify_one();
        if let Err(error) = self.handle.await {
            tracing::warn!(%error, "Sync worker ended abnormally");
        }
    }
}

async fn run(engine: SyncEngine, cancel: DrainCancel, stop: Arc<Notify>) {
    let mut online = engine.connectivity().subscribe();
    let mut ticker = engine.config().sync_interval.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    tracing::debug!("Sync worker started");

    drain_once(&engine, &cancel).await;
    loop {
        tokio::select! {
            () = stop.notified() => break,
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
                let is_online = *online.borrow_and_update();
                if is_online {
                    drain_once(&engine, &cancel).await;
                }
            }
            () = engine.woken() => drain_once(&engine, &cancel).await,
            () = tick(ticker.as_mut()) => drain_once(&engine, &cancel).await,
        }
        if cancel.is_cancelled() {
            break;
        }
    }
    tracing::debug!("Sync worker stopped");
}

async fn tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn drain_once(engine: &SyncEngine, cancel: &DrainCancel) {
    match engine.drain_with(cancel).await {
        Ok(report) => tracing::debug!(?report, "Background sync pass"),
        Err(error) => tracing::error!(%error, "Background sync pass failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::db::Database;
    use crate::models::{ReportDraft, Session, SyncStatus};
    use crate::net::{MemoryBackend, SessionContext};
    use crate::store::LocalStore;
    use crate::sync::ConnectivityMonitor;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn engine(dir: &std::path::Path, config: SyncConfig) -> SyncEngine {
        let store = LocalStore::new(Database::open_in_memory().unwrap().into_shared());
        let stager = store.stager(dir);
        let sessions = SessionContext::in_memory();
        sessions
            .set(Session {
                token: "tok".to_string(),
                user_id: "admin0000000001".to_string(),
                full_name: "Ana Cruz".to_string(),
                responder_id: None,
            })
            .await
            .unwrap();
        SyncEngine::new(
            store,
            stager,
            Arc::new(MemoryBackend::new()),
            sessions,
            ConnectivityMonitor::new(false),
            config,
        )
        .unwrap()
    }

    async fn wait_for_status(engine: &SyncEngine, id: &crate::models::ReportId, status: SyncStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let report = engine.store().get_report(id).await.unwrap().unwrap();
                if report.sync_status == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_drains_when_connectivity_returns() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), SyncConfig::default().without_auto_sync()).await;
        let worker = SyncWorker::spawn(engine.clone());

        let report = engine
            .store()
            .create_report(ReportDraft::new("Sinkhole"))
            .await
            .unwrap();
        engine.connectivity().set_online(true);

        wait_for_status(&engine, &report.id, SyncStatus::Synced).await;
        worker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_drains_when_woken() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), SyncConfig::default().without_auto_sync()).await;
        engine.connectivity().set_online(true);
        let worker = SyncWorker::spawn(engine.clone());

        let report = engine
            .store()
            .create_report(ReportDraft::new("Power outage"))
            .await
            .unwrap();
        engine.wake();

        wait_for_status(&engine, &report.id, SyncStatus::Synced).await;
        worker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_drains_on_interval() {
        let dir = tempdir().unwrap();
        let config = SyncConfig::default().with_sync_interval(Duration::from_millis(20));
        let engine = engine(dir.path(), config).await;
        engine.connectivity().set_online(true);
        let worker = SyncWorker::spawn(engine.clone());

        let report = engine
            .store()
            .create_report(ReportDraft::new("Water main break"))
            .await
            .unwrap();

        wait_for_status(&engine, &report.id, SyncStatus::Synced).await;
        worker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_stops_task() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), SyncConfig::default().without_auto_sync()).await;
        let worker = SyncWorker::spawn(engine);
        assert!(!worker.is_finished());

        tokio::time::timeout(Duration::from_secs(5), worker.shutdown())
            .await
            .unwrap();
    }
}
