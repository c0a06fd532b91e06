//! Startup-built application context.
//!
//! Everything the pipeline needs — settings, stores, broker, event bus,
//! providers — is constructed once at startup and passed around explicitly.

use crate::providers::delivery::{build_delivery_provider, DeliveryProvider};
use crate::providers::enhance::{build_enhance_provider, EnhanceProvider};
use crate::providers::stt::{build_stt_provider, SttProvider};
use mia_common::blob::{BlobStore, FsBlobStore};
use mia_common::config::Settings;
use mia_common::events::{EventBus, MiaEvent};
use mia_common::locks::MeetingLocks;
use mia_common::metrics::Metrics;
use mia_common::queue::broker::{Broker, SqliteBroker};
use mia_common::{db, Result};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;

/// Shared context for the ingest path and all pipeline stages.
#[derive(Clone)]
pub struct PipelineContext {
    pub settings: Arc<Settings>,
    pub db: SqlitePool,
    pub blob: Arc<dyn BlobStore>,
    pub broker: Arc<dyn Broker>,
    pub bus: EventBus,
    pub locks: MeetingLocks,
    pub metrics: Arc<Metrics>,
    pub stt: Arc<dyn SttProvider>,
    pub enhancer: Arc<dyn EnhanceProvider>,
    pub delivery: Arc<dyn DeliveryProvider>,
}

impl PipelineContext {
    /// Build the context from settings: opens the database, prepares blob
    /// storage, wires the broker and resolves the configured providers.
    pub async fn initialize(settings: Settings) -> Result<Arc<Self>> {
        let pool = db::init_database(Path::new(&settings.database_path)).await?;
        Ok(Self::assemble(settings, pool)?)
    }

    /// Assemble a context over an existing pool (used by tests with
    /// in-memory databases).
    pub fn assemble(settings: Settings, pool: SqlitePool) -> Result<Arc<Self>> {
        let stt = build_stt_provider(&settings)?;
        let enhancer = build_enhance_provider(&settings)?;
        let delivery = build_delivery_provider(&settings)?;
        let blob: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(settings.chunks_dir.clone()));
        let broker: Arc<dyn Broker> = Arc::new(SqliteBroker::new(pool.clone()));

        Ok(Arc::new(Self {
            settings: Arc::new(settings),
            db: pool,
            blob,
            broker,
            bus: EventBus::new(256),
            locks: MeetingLocks::new(),
            metrics: Arc::new(Metrics::new()),
            stt,
            enhancer,
            delivery,
        }))
    }

    /// Emit an event on the in-process bus and append it to the durable
    /// feed so the other process's WebSocket forwarder sees it too.
    pub async fn emit_event(&self, event: MiaEvent) {
        if let Err(e) = db::events_feed::append_event(&self.db, &event).await {
            tracing::warn!(error = %e, "event feed append failed");
        }
        self.bus.emit_lossy(event);
    }
}
