//! Export Controller
//!
//! Owns the work queue, the retry scheduler and the worker pool. Each worker
//! takes a key, resolves a fresh snapshot, decides, and writes. Watch events
//! only trigger reconciliation; they never carry the state that is acted on.

use crate::config::ExporterConfig;
use crate::domain::model::Volume;
use crate::domain::ports::{EventSinkRef, ResourceStoreRef};
use crate::error::{Error, ErrorAction, Result};
use crate::events::EventKind;
use crate::metrics::ExporterMetrics;
use crate::observer::correlation::{CorrelationEvent, CorrelationKey};
use crate::observer::watch::ResourceObserver;
use crate::reconciler::decision::{decide, DeferReason};
use crate::reconciler::queue::WorkQueue;
use crate::reconciler::scheduler::{RetryScheduler, SchedulerLoop};
use crate::reconciler::writer::{AnnotationWriter, Prepared, WriteOutcome};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Result of one reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Export records were written
    Exported {
        kinds: Vec<EventKind>,
        keys_written: usize,
    },
    /// Nothing left to export
    Converged,
    /// Cannot progress until the backend or front-end settles
    Deferred(DeferReason),
    /// Not a front-end volume, or nothing left to annotate
    Skipped,
    /// The backend claim vanished before the write
    BackendGone,
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Exported { .. } => "exported",
            ReconcileOutcome::Converged => "converged",
            ReconcileOutcome::Deferred(_) => "deferred",
            ReconcileOutcome::Skipped => "skipped",
            ReconcileOutcome::BackendGone => "backend_gone",
        }
    }
}

/// Reconciles front-end volume lifecycles onto backend claims
pub struct ExportController {
    config: ExporterConfig,
    store: ResourceStoreRef,
    observer: Arc<ResourceObserver>,
    writer: AnnotationWriter,
    sink: EventSinkRef,
    metrics: ExporterMetrics,
    queue: Arc<WorkQueue>,
    scheduler: RetryScheduler,
    scheduler_loop: Mutex<Option<SchedulerLoop>>,
}

impl ExportController {
    pub fn new(
        config: ExporterConfig,
        store: ResourceStoreRef,
        sink: EventSinkRef,
        metrics: ExporterMetrics,
    ) -> Arc<Self> {
        let observer = Arc::new(ResourceObserver::new(store.clone(), &config));
        Self::with_observer(config, store, observer, sink, metrics)
    }

    pub fn with_observer(
        config: ExporterConfig,
        store: ResourceStoreRef,
        observer: Arc<ResourceObserver>,
        sink: EventSinkRef,
        metrics: ExporterMetrics,
    ) -> Arc<Self> {
        let queue = Arc::new(WorkQueue::new());
        let (scheduler, scheduler_loop) = RetryScheduler::new(queue.clone());

        Arc::new(Self {
            writer: AnnotationWriter::new(store.clone()),
            config,
            store,
            observer,
            sink,
            metrics,
            queue,
            scheduler,
            scheduler_loop: Mutex::new(Some(scheduler_loop)),
        })
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Queue a key for reconciliation
    pub fn enqueue(&self, key: CorrelationKey) {
        self.queue.enqueue(key);
        self.metrics.queue_depth.set(self.queue.depth() as i64);
    }

    // =========================================================================
    // Run Loop
    // =========================================================================

    /// Run until `cancel` fires. In-flight reconciliations finish first.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let scheduler_loop = self
            .scheduler_loop
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("controller is already running".into()))?;
        let scheduler = tokio::spawn(scheduler_loop.run(cancel.clone()));

        let mut workers = Vec::with_capacity(self.config.workers);
        for id in 0..self.config.workers {
            let controller = self.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move { controller.worker(id, cancel).await }));
        }

        info!(
            workers = self.config.workers,
            store = self.store.store_name(),
            sink = self.sink.sink_name(),
            "export controller started"
        );

        let mut events = self.observer.clone().watch(cancel.clone());
        while let Some(event) = events.next().await {
            debug!(volume = %event.key, "change observed");
            self.enqueue(event.key);
        }

        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task failed");
            }
        }
        if let Err(e) = scheduler.await {
            error!(error = %e, "retry scheduler task failed");
        }

        info!("export controller stopped");
        Ok(())
    }

    async fn worker(&self, id: usize, cancel: CancellationToken) {
        debug!(worker = id, "worker started");
        loop {
            let key = tokio::select! {
                _ = cancel.cancelled() => break,
                key = self.queue.next() => match key {
                    Some(key) => key,
                    None => break,
                },
            };

            self.process(&key).await;
            self.queue.done(&key);
            self.metrics.queue_depth.set(self.queue.depth() as i64);
        }
        debug!(worker = id, "worker stopped");
    }

    /// Reconcile one key and schedule its follow-up
    pub async fn process(&self, key: &CorrelationKey) {
        let timer = self.metrics.reconcile_duration.start_timer();
        let result = self.reconcile(key).await;
        timer.observe_duration();

        match result {
            Ok(outcome) => {
                self.metrics
                    .reconciliations
                    .with_label_values(&[outcome.label()])
                    .inc();
                match outcome {
                    ReconcileOutcome::Deferred(reason) => {
                        debug!(volume = %key, %reason, "reconciliation deferred");
                        self.scheduler
                            .schedule(key.clone(), self.config.resync_interval());
                    }
                    _ => self.scheduler.cancel(key.clone()),
                }
            }
            Err(e) => {
                self.metrics
                    .reconciliations
                    .with_label_values(&["error"])
                    .inc();
                let delay = match e.action() {
                    ErrorAction::RequeueWithBackoff => Some(self.config.error_requeue_interval()),
                    ErrorAction::RequeueAtResync => Some(self.config.resync_interval()),
                    ErrorAction::RequeueAfter(delay) => Some(delay),
                    ErrorAction::NoRequeue => None,
                };

                match &e {
                    Error::InvariantViolation { .. } => {
                        self.metrics.invariant_violations.inc();
                        error!(volume = %key, error = %e, "export invariant violated, leaving annotations untouched");
                    }
                    e if e.is_retryable() => {
                        warn!(volume = %key, kind = e.metric_label(), error = %e, "reconciliation failed, will retry")
                    }
                    e => warn!(volume = %key, kind = e.metric_label(), error = %e, "reconciliation failed"),
                }

                if let Some(delay) = delay {
                    self.scheduler.schedule(key.clone(), delay);
                }
            }
        }
        self.metrics.pending_retries.set(self.scheduler.pending() as i64);
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// One read-decide-write cycle, retried on write conflicts
    #[instrument(skip(self, key), fields(volume = %key))]
    pub async fn reconcile(&self, key: &CorrelationKey) -> Result<ReconcileOutcome> {
        let mut attempts = 0;
        let mut sent: HashSet<EventKind> = HashSet::new();
        loop {
            let event = self.observer.resolve(key).await?;
            if !self.observer.is_relevant(&event) {
                return Ok(ReconcileOutcome::Skipped);
            }
            if event.volume.as_ref().is_some_and(|v| self.needs_protection(v)) {
                self.sync_finalizer(key, FinalizerSync::HoldOnly).await?;
            }

            let plan = decide(&event, &event.backend.annotations())?;
            if let Some(reason) = plan.deferred() {
                self.metrics
                    .deferrals
                    .with_label_values(&[reason.as_str()])
                    .inc();
                if nothing_to_export(reason) {
                    self.release_orphaned(&event).await?;
                }
                return Ok(ReconcileOutcome::Deferred(reason));
            }

            let records = plan.records();
            if records.is_empty() {
                if event.volume.is_none() && !has_create_export(&event) {
                    info!("volume removed before its creation was exported, nothing to export");
                }
                self.sync_finalizer(key, FinalizerSync::HoldOrRelease).await?;
                return Ok(ReconcileOutcome::Converged);
            }

            let target = match event.backend.claim() {
                Some(claim) => claim.object_ref(),
                None => return Ok(ReconcileOutcome::BackendGone),
            };

            let write = match self.writer.prepare(&target, &records).await? {
                Prepared::Pending(write) => write,
                Prepared::NotFound => {
                    debug!(backend = %target, "backend claim gone before write");
                    return Ok(ReconcileOutcome::BackendGone);
                }
                // The snapshot was stale; decide again on fresh state
                Prepared::AlreadyPresent => {
                    attempts += 1;
                    self.check_attempts(key, attempts)?;
                    continue;
                }
            };

            for record in write.records() {
                if !sent.contains(&record.kind) {
                    self.sink.send(record).await?;
                    sent.insert(record.kind);
                }
            }

            match self.writer.commit(&write).await {
                Ok(WriteOutcome::Applied { keys_written }) => {
                    let kinds = write.kinds();
                    for kind in &kinds {
                        self.metrics
                            .exports
                            .with_label_values(&[kind.as_str()])
                            .inc();
                        info!(kind = %kind, backend = %target, "lifecycle event exported");
                    }
                    self.sync_finalizer(key, FinalizerSync::HoldOrRelease).await?;
                    return Ok(ReconcileOutcome::Exported { kinds, keys_written });
                }
                Ok(WriteOutcome::NotFound) => {
                    debug!(backend = %target, "backend claim gone before write");
                    return Ok(ReconcileOutcome::BackendGone);
                }
                Ok(WriteOutcome::AlreadyPresent) => {}
                Err(e) if e.is_conflict() => {
                    self.metrics.conflicts.inc();
                    debug!(attempt = attempts + 1, "write conflict, re-reading");
                }
                Err(e) => return Err(e),
            }

            attempts += 1;
            self.check_attempts(key, attempts)?;
        }
    }

    fn check_attempts(&self, key: &CorrelationKey, attempts: u32) -> Result<()> {
        if attempts >= self.config.max_conflict_retries {
            return Err(Error::ConflictRetriesExhausted {
                key: key.to_string(),
                attempts,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Finalizer
    // =========================================================================

    /// A live front-end volume we do not hold yet
    fn needs_protection(&self, volume: &Volume) -> bool {
        self.config.manage_finalizer
            && !volume.deletion_requested
            && !volume.has_finalizer(&self.config.finalizer)
    }

    /// Bring our finalizer on the volume in line with its lifecycle
    async fn sync_finalizer(&self, key: &CorrelationKey, mode: FinalizerSync) -> Result<()> {
        if !self.config.manage_finalizer {
            return Ok(());
        }

        for _ in 0..self.config.max_conflict_retries {
            let volume = match self.store.get_volume(key.as_str()).await? {
                Some(volume) if self.observer.is_frontend(&volume) => volume,
                _ => return Ok(()),
            };

            let finalizers = match self.desired_finalizers(&volume, mode) {
                Some(finalizers) => finalizers,
                None => return Ok(()),
            };

            match self.update_finalizers(&volume, &finalizers).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    self.metrics.conflicts.inc();
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::ConflictRetriesExhausted {
            key: key.to_string(),
            attempts: self.config.max_conflict_retries,
        })
    }

    /// Finalizer list to write, or `None` when already in the wanted state
    fn desired_finalizers(&self, volume: &Volume, mode: FinalizerSync) -> Option<Vec<String>> {
        let finalizer = &self.config.finalizer;
        match (volume.deletion_requested, volume.has_finalizer(finalizer)) {
            (true, true) if mode == FinalizerSync::HoldOrRelease => Some(
                volume
                    .finalizers
                    .iter()
                    .filter(|f| *f != finalizer)
                    .cloned()
                    .collect(),
            ),
            (false, false) => {
                let mut finalizers = volume.finalizers.clone();
                finalizers.push(finalizer.clone());
                Some(finalizers)
            }
            _ => None,
        }
    }

    async fn update_finalizers(&self, volume: &Volume, finalizers: &[String]) -> Result<()> {
        let resource_version = volume.resource_version.as_deref().ok_or_else(|| {
            Error::Internal(format!("volume {} has no resource version", volume.name))
        })?;

        match self
            .store
            .set_volume_finalizers(&volume.name, resource_version, finalizers)
            .await
        {
            Ok(_) => {
                debug!(volume = %volume.name, finalizers = finalizers.len(), "finalizers updated");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Release a deleting volume whose lifecycle can no longer be exported
    async fn release_orphaned(&self, event: &CorrelationEvent) -> Result<()> {
        if !self.config.manage_finalizer {
            return Ok(());
        }
        let volume = match &event.volume {
            Some(volume)
                if volume.deletion_requested && volume.has_finalizer(&self.config.finalizer) =>
            {
                volume
            }
            _ => return Ok(()),
        };

        warn!(
            volume = %volume.name,
            "nothing to export for deleting volume, releasing finalizer"
        );
        match self.desired_finalizers(volume, FinalizerSync::HoldOrRelease) {
            Some(finalizers) => self.update_finalizers(volume, &finalizers).await,
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalizerSync {
    /// Add the finalizer to live volumes, never remove it
    HoldOnly,
    /// Also release it once a deleting volume is fully exported
    HoldOrRelease,
}

/// Whether a deferral can never turn into an export: the backend claim is
/// gone, or the volume never bound so no create facts exist
fn nothing_to_export(reason: DeferReason) -> bool {
    matches!(
        reason,
        DeferReason::BackendNotReady | DeferReason::FrontendNotBound
    )
}

fn has_create_export(event: &CorrelationEvent) -> bool {
    crate::events::has_any_key(EventKind::Create, &event.backend.annotations())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_FINALIZER;
    use crate::domain::model::{Claim, ObjectRef, ReclaimPolicy};
    use crate::domain::ports::EventSink;
    use crate::events::keys::*;
    use crate::events::ExportRecord;
    use crate::sink::NoopSink;
    use crate::store::InMemoryStore;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use prometheus::Registry;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    const PROVISIONER: &str = "openebs.io/nfsrwx";

    /// Records every delivery; fails the first `failures` sends
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<ExportRecord>>,
        failures: AtomicU32,
    }

    impl RecordingSink {
        fn failing(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<ExportRecord> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn send(&self, record: &ExportRecord) -> Result<()> {
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(Error::StoreUnavailable {
                    reason: "callback receiver unavailable".into(),
                });
            }
            self.sent.lock().push(record.clone());
            Ok(())
        }

        fn sink_name(&self) -> &str {
            "recording"
        }
    }

    fn controller(store: Arc<InMemoryStore>) -> Arc<ExportController> {
        controller_with_sink(store, Arc::new(NoopSink))
    }

    fn controller_with_sink(store: Arc<InMemoryStore>, sink: EventSinkRef) -> Arc<ExportController> {
        let metrics = ExporterMetrics::register(&Registry::new()).unwrap();
        ExportController::new(ExporterConfig::default(), store, sink, metrics)
    }

    fn seed(store: &InMemoryStore, policy: ReclaimPolicy) {
        store.put_volume(
            Volume::new("pv-xyz", policy)
                .provisioned_by(PROVISIONER)
                .bound_to(ObjectRef::new("app-ns", "pvc1")),
        );
        store.put_claim(Claim::new("app-ns", "pvc1").bound_to("pv-xyz"));
        store.put_claim(Claim::new("openebs", "nfs-pv-xyz").bound_to("pv-backend-abc"));
    }

    fn key() -> CorrelationKey {
        CorrelationKey::new("pv-xyz")
    }

    #[tokio::test]
    async fn test_create_export_and_finalizer() {
        let store = InMemoryStore::new();
        seed(&store, ReclaimPolicy::Retain);
        let controller = controller(store.clone());

        let outcome = controller.reconcile(&key()).await.unwrap();
        assert_matches!(outcome, ReconcileOutcome::Exported { ref kinds, keys_written: 4 } if kinds == &[EventKind::Create]);

        let backend = store.claim("openebs", "nfs-pv-xyz").unwrap();
        assert_eq!(backend.annotations[VOLUME_CREATE_NFS_PVC_KEY], "app-ns-pvc1");
        assert!(store.volume("pv-xyz").unwrap().has_finalizer(DEFAULT_FINALIZER));

        assert_eq!(controller.reconcile(&key()).await.unwrap(), ReconcileOutcome::Converged);
        assert_eq!(store.annotation_writes(), 1);
    }

    #[tokio::test]
    async fn test_missing_backend_defers() {
        let store = InMemoryStore::new();
        seed(&store, ReclaimPolicy::Delete);
        store.update_claim("openebs", "nfs-pv-xyz", |c| c.volume_name = None);
        let controller = controller(store.clone());

        assert_eq!(
            controller.reconcile(&key()).await.unwrap(),
            ReconcileOutcome::Deferred(DeferReason::BackendNotBound)
        );
        assert_eq!(store.annotation_writes(), 0);
        // Held while waiting so the deletion cannot slip past
        assert!(store.volume("pv-xyz").unwrap().has_finalizer(DEFAULT_FINALIZER));
    }

    #[tokio::test]
    async fn test_delete_before_backend_binds_exports_both_events() {
        let store = InMemoryStore::new();
        seed(&store, ReclaimPolicy::Delete);
        store.update_claim("openebs", "nfs-pv-xyz", |c| c.volume_name = None);
        let controller = controller(store.clone());

        assert_eq!(
            controller.reconcile(&key()).await.unwrap(),
            ReconcileOutcome::Deferred(DeferReason::BackendNotBound)
        );
        store.delete_claim("app-ns", "pvc1");
        store.request_volume_deletion("pv-xyz");
        assert!(store.volume("pv-xyz").is_some());
        assert_eq!(
            controller.reconcile(&key()).await.unwrap(),
            ReconcileOutcome::Deferred(DeferReason::BackendNotBound)
        );

        store.update_claim("openebs", "nfs-pv-xyz", |c| {
            c.volume_name = Some("pv-backend-abc".into())
        });
        let outcome = controller.reconcile(&key()).await.unwrap();
        assert_matches!(
            outcome,
            ReconcileOutcome::Exported { ref kinds, keys_written: 8 }
                if kinds == &[EventKind::Create, EventKind::Delete]
        );
        assert_eq!(store.annotation_writes(), 1);
        assert!(store.volume("pv-xyz").is_none());
    }

    #[tokio::test]
    async fn test_unbound_deleting_volume_releases_finalizer() {
        let store = InMemoryStore::new();
        store.put_volume(Volume::new("pv-xyz", ReclaimPolicy::Delete).provisioned_by(PROVISIONER));
        store.put_claim(Claim::new("openebs", "nfs-pv-xyz").bound_to("pv-backend-abc"));
        let controller = controller(store.clone());

        controller.reconcile(&key()).await.unwrap();
        assert!(store.volume("pv-xyz").unwrap().has_finalizer(DEFAULT_FINALIZER));

        store.request_volume_deletion("pv-xyz");
        assert_eq!(
            controller.reconcile(&key()).await.unwrap(),
            ReconcileOutcome::Deferred(DeferReason::FrontendNotBound)
        );
        assert!(store.volume("pv-xyz").is_none());
        assert_eq!(store.annotation_writes(), 0);
    }

    #[tokio::test]
    async fn test_foreign_volume_is_skipped() {
        let store = InMemoryStore::new();
        store.put_volume(Volume::new("pv-xyz", ReclaimPolicy::Delete).provisioned_by("other.io/csi"));
        let controller = controller(store.clone());

        assert_eq!(controller.reconcile(&key()).await.unwrap(), ReconcileOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_deleting_volume_exports_delete_then_releases_finalizer() {
        let store = InMemoryStore::new();
        seed(&store, ReclaimPolicy::Retain);
        let controller = controller(store.clone());
        controller.reconcile(&key()).await.unwrap();

        store.delete_claim("app-ns", "pvc1");
        assert_eq!(controller.reconcile(&key()).await.unwrap(), ReconcileOutcome::Converged);

        store.request_volume_deletion("pv-xyz");
        assert!(store.volume("pv-xyz").is_some());

        let outcome = controller.reconcile(&key()).await.unwrap();
        assert_matches!(outcome, ReconcileOutcome::Exported { ref kinds, .. } if kinds == &[EventKind::Delete]);
        assert!(store.volume("pv-xyz").is_none());

        let backend = store.claim("openebs", "nfs-pv-xyz").unwrap();
        assert_eq!(backend.annotations[VOLUME_DELETE_NFS_PVC_KEY], "app-ns-pvc1");
        assert_eq!(backend.annotations[VOLUME_DELETE_BACKEND_PV_KEY], "pv-backend-abc");
    }

    #[tokio::test]
    async fn test_orphaned_deleting_volume_releases_finalizer() {
        let store = InMemoryStore::new();
        seed(&store, ReclaimPolicy::Delete);
        let controller = controller(store.clone());
        controller.reconcile(&key()).await.unwrap();

        // Backend collected before the front-end deletion was seen
        store.delete_claim("openebs", "nfs-pv-xyz");
        store.request_volume_deletion("pv-xyz");
        assert!(store.volume("pv-xyz").is_some());

        assert_eq!(
            controller.reconcile(&key()).await.unwrap(),
            ReconcileOutcome::Deferred(DeferReason::BackendNotReady)
        );
        assert!(store.volume("pv-xyz").is_none());
    }

    #[tokio::test]
    async fn test_invariant_violation_is_not_overwritten() {
        let store = InMemoryStore::new();
        seed(&store, ReclaimPolicy::Retain);
        store.update_claim("openebs", "nfs-pv-xyz", |c| {
            c.annotations
                .insert(VOLUME_CREATE_NFS_PV_KEY.into(), "pv-someone-else".into());
        });
        let controller = controller(store.clone());

        let err = controller.reconcile(&key()).await.unwrap_err();
        assert_matches!(err, Error::InvariantViolation { .. });
        assert_eq!(err.action(), ErrorAction::RequeueAtResync);
        assert_eq!(store.annotation_writes(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_by_observer() {
        let store = InMemoryStore::new();
        seed(&store, ReclaimPolicy::Retain);
        store.inject_transient_failures(2);
        let controller = controller(store.clone());

        assert_matches!(
            controller.reconcile(&key()).await,
            Ok(ReconcileOutcome::Exported { .. })
        );
    }

    #[tokio::test]
    async fn test_conflicts_are_bounded() {
        let store = InMemoryStore::new();
        seed(&store, ReclaimPolicy::Retain);
        let controller = controller(store.clone());
        let retries = controller.config.max_conflict_retries;
        store.inject_annotation_conflicts(retries);

        let err = controller.reconcile(&key()).await.unwrap_err();
        assert_matches!(err, Error::ConflictRetriesExhausted { attempts, .. } if attempts == retries);
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
        assert_eq!(controller.metrics.conflicts.get(), u64::from(retries));
        assert_eq!(store.annotation_writes(), 0);

        assert_matches!(
            controller.reconcile(&key()).await,
            Ok(ReconcileOutcome::Exported { .. })
        );
    }

    #[tokio::test]
    async fn test_sink_receives_each_record_once_per_pass() {
        let store = InMemoryStore::new();
        seed(&store, ReclaimPolicy::Retain);
        let sink = Arc::new(RecordingSink::default());
        let controller = controller_with_sink(store.clone(), sink.clone());
        store.inject_annotation_conflicts(2);

        assert_matches!(
            controller.reconcile(&key()).await,
            Ok(ReconcileOutcome::Exported { .. })
        );
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(sink.sent()[0].kind, EventKind::Create);

        // Converged passes post nothing
        assert_eq!(controller.reconcile(&key()).await.unwrap(), ReconcileOutcome::Converged);
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_blocks_write() {
        let store = InMemoryStore::new();
        seed(&store, ReclaimPolicy::Retain);
        let sink = Arc::new(RecordingSink::failing(1));
        let controller = controller_with_sink(store.clone(), sink.clone());

        let err = controller.reconcile(&key()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.annotation_writes(), 0);
        assert!(sink.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_requeue_intervals() {
        let store = InMemoryStore::new();
        seed(&store, ReclaimPolicy::Retain);
        let sink = Arc::new(RecordingSink::failing(1));
        let controller = controller_with_sink(store.clone(), sink);
        let cancel = CancellationToken::new();
        let timer_loop = controller.scheduler_loop.lock().take().unwrap();
        tokio::spawn(timer_loop.run(cancel.clone()));

        // Transient failure: short error interval
        let started = Instant::now();
        controller.process(&key()).await;
        assert_eq!(store.annotation_writes(), 0);
        assert_eq!(controller.queue().next().await, Some(key()));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(11), "{:?}", waited);
        controller.queue().done(&key());

        // Deferral: steady-state resync interval
        store.delete_claim("openebs", "nfs-pv-xyz");
        let started = Instant::now();
        controller.process(&key()).await;
        assert_eq!(controller.queue().next().await, Some(key()));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(60) && waited < Duration::from_secs(61), "{:?}", waited);
        controller.queue().done(&key());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_concurrent_reconciliations_write_once() {
        let store = InMemoryStore::new();
        seed(&store, ReclaimPolicy::Retain);
        let controller = controller(store.clone());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let controller = controller.clone();
            handles.push(tokio::spawn(async move { controller.reconcile(&key()).await }));
        }
        for handle in handles {
            // Losers see a conflict or an already-converged claim
            let _ = handle.await.unwrap();
        }

        assert_eq!(store.annotation_writes(), 1);
        let backend = store.claim("openebs", "nfs-pv-xyz").unwrap();
        assert_eq!(backend.annotations[VOLUME_CREATE_BACKEND_PV_KEY], "pv-backend-abc");
    }

    #[tokio::test]
    async fn test_run_exports_and_stops_on_cancel() {
        let store = InMemoryStore::new();
        seed(&store, ReclaimPolicy::Retain);
        let controller = controller(store.clone());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.clone().run(cancel.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.annotation_writes() == 0 {
            assert!(tokio::time::Instant::now() < deadline, "create was never exported");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(controller.clone().run(CancellationToken::new()).await.is_err());
    }
}
