//! Event Sinks
//!
//! Export records are mirrored to an optional HTTP receiver before they are
//! annotated on the backend claim. Delivery is at-least-once: a record may be
//! posted again if the annotation write that follows it fails.

use crate::config::ExporterConfig;
use crate::domain::ports::{EventSink, EventSinkRef};
use crate::error::Result;
use crate::events::{EventKind, ExportRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// JSON body posted for each record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload<'a> {
    pub kind: EventKind,
    pub nfs_pvc: &'a str,
    pub nfs_pv: &'a str,
    pub backend_pvc: &'a str,
    pub backend_pv: &'a str,
    pub occurred_at: DateTime<Utc>,
}

impl<'a> EventPayload<'a> {
    pub fn new(record: &'a ExportRecord, occurred_at: DateTime<Utc>) -> Self {
        Self {
            kind: record.kind,
            nfs_pvc: &record.nfs_pvc,
            nfs_pv: &record.nfs_pv,
            backend_pvc: &record.backend_pvc,
            backend_pv: &record.backend_pv,
            occurred_at,
        }
    }
}

/// Posts export records to an HTTP endpoint
pub struct HttpEventSink {
    client: reqwest::Client,
    url: String,
}

impl HttpEventSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn send(&self, record: &ExportRecord) -> Result<()> {
        let payload = EventPayload::new(record, Utc::now());
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        debug!(kind = %record.kind, volume = %record.nfs_pv, url = %self.url, "event delivered");
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "http"
    }
}

/// Discards every record
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    async fn send(&self, _record: &ExportRecord) -> Result<()> {
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "noop"
    }
}

/// Build the sink selected by the configuration
pub fn from_config(config: &ExporterConfig) -> Result<EventSinkRef> {
    match &config.callback_url {
        Some(url) => Ok(Arc::new(HttpEventSink::new(url, config.callback_timeout())?)),
        None => Ok(Arc::new(NoopSink)),
    }
}
