//! Resource Observer
//!
//! Turns store change notifications and a periodic resync tick into a stream
//! of correlation events, and resolves the current snapshot of a single
//! correlation on demand. Transient read failures are retried here with
//! exponential backoff and never reach the reconciler.

use crate::config::ExporterConfig;
use crate::domain::model::Volume;
use crate::domain::ports::{ResourceChange, ResourceStoreRef};
use crate::error::{Error, Result};
use crate::observer::correlation::{BackendState, CorrelationEvent, CorrelationKey, NamingConvention};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

// =============================================================================
// Read Retry Policy
// =============================================================================

/// Backoff applied to transient read failures
#[derive(Debug, Clone)]
pub struct ReadRetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up and surface the error after this long
    pub max_elapsed: Duration,
}

impl Default for ReadRetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(30),
        }
    }
}

impl ReadRetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build()
    }
}

// =============================================================================
// Resource Observer
// =============================================================================

/// Watches volumes and claims and emits correlation events
pub struct ResourceObserver {
    store: ResourceStoreRef,
    naming: NamingConvention,
    provisioner: String,
    resync_interval: Duration,
    retry: ReadRetryPolicy,
}

impl ResourceObserver {
    pub fn new(store: ResourceStoreRef, config: &ExporterConfig) -> Self {
        Self {
            store,
            naming: NamingConvention::from_config(config),
            provisioner: config.provisioner.clone(),
            resync_interval: config.resync_interval(),
            retry: ReadRetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: ReadRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn naming(&self) -> &NamingConvention {
        &self.naming
    }

    /// Whether a volume was created by the NFS provisioner
    pub fn is_frontend(&self, volume: &Volume) -> bool {
        volume.provisioner() == Some(self.provisioner.as_str())
    }

    /// Whether an event concerns a front-end volume worth reconciling.
    ///
    /// A removed volume is only relevant while its backend claim still
    /// exists; otherwise there is nothing left to annotate.
    pub fn is_relevant(&self, event: &CorrelationEvent) -> bool {
        match &event.volume {
            Some(volume) => self.is_frontend(volume),
            None => matches!(event.backend, BackendState::Found(_)),
        }
    }

    /// Resolve the current snapshot of one correlation
    pub async fn resolve(&self, key: &CorrelationKey) -> Result<CorrelationEvent> {
        self.read_with_retry(move || self.resolve_once(key)).await
    }

    async fn resolve_once(&self, key: &CorrelationKey) -> Result<CorrelationEvent> {
        let volume = self.store.get_volume(key.as_str()).await?;

        let claim = match volume.as_ref().and_then(|v| v.claim_ref.as_ref()) {
            Some(claim_ref) => self
                .store
                .get_claim(&claim_ref.namespace, &claim_ref.name)
                .await?
                // A claim recreated under the same name belongs to another volume
                .filter(|claim| {
                    claim
                        .volume_name
                        .as_deref()
                        .map_or(true, |name| name == key.as_str())
                }),
            None => None,
        };

        let backend_ref = self.naming.backend_claim(key);
        let backend = match self
            .store
            .get_claim(&backend_ref.namespace, &backend_ref.name)
            .await?
        {
            Some(claim) => BackendState::Found(claim),
            None => BackendState::NotFound,
        };

        Ok(CorrelationEvent {
            key: key.clone(),
            volume,
            claim,
            backend,
            observed_at: Utc::now(),
        })
    }

    /// Correlation keys affected by a change
    pub async fn keys_for_change(&self, change: &ResourceChange) -> Result<Vec<CorrelationKey>> {
        match change {
            ResourceChange::Volume { name, provisioner } => {
                // Deleted objects still carry their provisioner; skip foreign volumes early
                if provisioner
                    .as_deref()
                    .is_some_and(|p| p != self.provisioner)
                {
                    return Ok(Vec::new());
                }
                Ok(vec![CorrelationKey::new(name.clone())])
            }
            ResourceChange::Claim {
                namespace,
                name,
                volume_name,
            } => Ok(self
                .naming
                .key_for_backend_claim(namespace, name)
                .or_else(|| volume_name.clone().map(CorrelationKey::from))
                .into_iter()
                .collect()),
            ResourceChange::Resync => self.list_all_keys().await,
        }
    }

    async fn list_all_keys(&self) -> Result<Vec<CorrelationKey>> {
        let store = &self.store;
        let namespace = self.naming.system_namespace.as_str();
        let volumes = self.read_with_retry(move || store.list_volumes()).await?;
        let claims = self
            .read_with_retry(move || store.list_claims(namespace))
            .await?;

        let mut keys = BTreeSet::new();
        keys.extend(
            volumes
                .iter()
                .filter(|volume| self.is_frontend(volume))
                .map(|volume| CorrelationKey::new(volume.name.clone())),
        );
        keys.extend(
            claims
                .iter()
                .filter_map(|claim| self.naming.key_for_backend_claim(&claim.namespace, &claim.name)),
        );

        debug!(count = keys.len(), "resync listed correlations");
        Ok(keys.into_iter().collect())
    }

    /// Infinite stream of correlation events, ending only on cancellation.
    ///
    /// Emits on every relevant store change and for every known correlation
    /// at each resync tick (the first tick fires immediately, catching up
    /// after a restart).
    pub fn watch(self: Arc<Self>, cancel: CancellationToken) -> BoxStream<'static, CorrelationEvent> {
        let mut ticker = tokio::time::interval(self.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let resync = stream::unfold(ticker, |mut ticker| async move {
            ticker.tick().await;
            Some((Ok(ResourceChange::Resync), ticker))
        });

        let changes = stream::select(self.store.changes(), resync);
        let observer = self;

        changes
            .take_until(async move { cancel.cancelled().await })
            .then(move |change| {
                let observer = observer.clone();
                async move { observer.events_for(change).await }
            })
            .flat_map(stream::iter)
            .boxed()
    }

    async fn events_for(&self, change: Result<ResourceChange>) -> Vec<CorrelationEvent> {
        let change = match change {
            Ok(change) => change,
            Err(e) => {
                warn!(error = %e, "change feed error, waiting for next notification");
                return Vec::new();
            }
        };

        let keys = match self.keys_for_change(&change).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, ?change, "failed to map change to volumes");
                return Vec::new();
            }
        };

        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            match self.resolve(&key).await {
                Ok(event) if self.is_relevant(&event) => {
                    if event.backend == BackendState::NotFound {
                        debug!(volume = %key, "backend claim not found yet");
                    }
                    events.push(event);
                }
                Ok(_) => trace!(volume = %key, "ignoring volume outside the exporter's scope"),
                Err(e) => warn!(volume = %key, error = %e, "failed to resolve correlation"),
            }
        }
        events
    }

    async fn read_with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        backoff::future::retry(self.retry.backoff(), || {
            let attempt = op();
            async move { attempt.await.map_err(classify) }
        })
        .await
    }
}

fn classify(error: Error) -> backoff::Error<Error> {
    if error.is_transient() {
        debug!(error = %error, "transient read failure, backing off");
        backoff::Error::transient(error)
    } else {
        backoff::Error::permanent(error)
    }
}
