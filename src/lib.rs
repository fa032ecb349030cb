//! Volume Events Exporter
//!
//! A Kubernetes controller that mirrors the lifecycle of NFS front-end
//! volumes onto the backend claims that serve them. For every front-end
//! volume it records a create event once the volume is bound, and a delete
//! event once the volume is irrevocably going away, as annotations on the
//! backend claim `<system namespace>/<prefix><volume name>`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                         Resource Store (port)                               │
//! │        Kubernetes API (kube)        │        In-memory (tests)              │
//! └──────────────────┬──────────────────────────────────────▲───────────────────┘
//!                    │ changes + resync tick                │ conditional patch
//!        ┌───────────▼───────────┐                ┌─────────┴───────────┐
//!        │   Resource Observer   │                │  Annotation Writer  │
//!        │ (correlate by naming) │                └─────────▲───────────┘
//!        └───────────┬───────────┘                          │ records
//!                    │ keys                       ┌─────────┴───────────┐
//!        ┌───────────▼───────────┐   key          │   decide (pure)     │
//!        │      Work Queue       ├───────────────►│  fresh snapshot +   │
//!        │  (one key in flight)  │   workers      │  current annotations│
//!        └───────────▲───────────┘                └─────────┬───────────┘
//!                    │ re-enqueue                           │ defer / error
//!        ┌───────────┴───────────┐                          │
//!        │    Retry Scheduler    │◄─────────────────────────┘
//!        │    (DelayQueue)       │
//!        └───────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`domain`]: Resource model and ports
//! - [`events`]: Annotation keys and export records
//! - [`observer`]: Correlation and change watching
//! - [`reconciler`]: Decision, writing, queueing and the controller
//! - [`store`]: Kubernetes and in-memory store adapters
//! - [`sink`]: Optional HTTP event delivery
//! - [`config`], [`metrics`], [`error`]: Ambient support

pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod metrics;
pub mod observer;
pub mod reconciler;
pub mod sink;
pub mod store;

// Re-export commonly used types
pub use config::ExporterConfig;

pub use domain::model::{Claim, ClaimPhase, ObjectRef, ReclaimPolicy, Volume, VolumePhase};
pub use domain::ports::{EventSink, EventSinkRef, ResourceChange, ResourceStore, ResourceStoreRef};

pub use error::{Error, ErrorAction, Result};

pub use events::{EventKind, ExportRecord, Presence};

pub use metrics::ExporterMetrics;

pub use observer::{BackendState, CorrelationEvent, CorrelationKey, NamingConvention, ResourceObserver};

pub use reconciler::{
    decide, Action, AnnotationWriter, DeferReason, ExportController, Plan, ReconcileOutcome,
    RetryScheduler, WorkQueue, WriteOutcome,
};

pub use sink::{HttpEventSink, NoopSink};

pub use store::{InMemoryStore, KubeStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
