//! Engine Assembly
//!
//! Wires the collaborators into the services and registers the built-in event
//! handlers on the engine's own [`EventBus`]:
//!
//! ```text
//! RecordService ──> TransactionManager ──> EventBus ──> handlers
//!       ^                                                  │
//!       └────────────── RecalculationHandler (weak) ───────┘
//! ```
//!
//! # Examples
//!
//! ```rust
//! use gridbase_core::models::{Field, FieldConfig, FormulaConfig, RecordData};
//! use gridbase_core::services::{Engine, WriteOptions};
//! use gridbase_core::EngineConfig;
//!
//! # tokio_test::block_on(async {
//! let engine = Engine::in_memory(EngineConfig::default()).unwrap();
//! let fields = engine.fields();
//! fields
//!     .create_field(Field::with_id("a", "t1", "A", FieldConfig::Number(Default::default())), "alice")
//!     .await
//!     .unwrap();
//! let double = FieldConfig::Formula(FormulaConfig { expression: "{A} * 2".into(), timezone: None });
//! fields.create_field(Field::with_id("b", "t1", "B", double), "alice").await.unwrap();
//!
//! let record = engine
//!     .records()
//!     .create_record("t1", RecordData::new().with("a", 21.0), WriteOptions::by("alice"))
//!     .await
//!     .unwrap();
//! assert_eq!(record.get("b").and_then(|v| v.as_number()), Some(42.0));
//! # });
//! ```

use crate::config::EngineConfig;
use crate::db::{
    DomainEvent, FieldStore, MemoryStore, RecordStore, SchemaProvider, TransactionManager, TransactionProvider,
};
use crate::expression::{ExpressionEvaluator, FormulaEngine};
use crate::operations::WorkerPool;
use crate::services::{
    AuditLogHandler, BroadcastNotifier, CacheInvalidationHandler, CalculationService, EngineError, EventBus,
    FieldCache, FieldService, RealtimeNotifier, RecalculationHandler, RecordService,
};
use std::sync::Arc;
use tokio::sync::broadcast;

/// External collaborators the engine consumes
#[derive(Clone)]
pub struct EngineCollaborators {
    pub fields: Arc<dyn FieldStore>,
    pub records: Arc<dyn RecordStore>,
    pub transactions: Arc<dyn TransactionProvider>,
    pub schema: Arc<dyn SchemaProvider>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub notifier: Option<Arc<dyn RealtimeNotifier>>,
}

pub struct Engine {
    config: EngineConfig,
    bus: Arc<EventBus>,
    field_cache: Arc<FieldCache>,
    calculator: Arc<CalculationService>,
    records: Arc<RecordService>,
    fields: FieldService,
    audit: Arc<AuditLogHandler>,
    memory: Option<Arc<MemoryStore>>,
    broadcaster: Option<BroadcastNotifier>,
}

impl Engine {
    pub fn new(config: EngineConfig, collaborators: EngineCollaborators) -> Result<Self, EngineError> {
        config.validate()?;

        let bus = Arc::new(
            EventBus::new(config.event_channel_capacity)
                .with_retry(config.handler_max_retries, config.handler_retry_delay()),
        );
        let transactions = TransactionManager::new(collaborators.transactions, config.transaction_options())
            .with_publisher(bus.clone());

        let field_cache = Arc::new(FieldCache::new(collaborators.fields.clone()));
        let calculator = Arc::new(
            CalculationService::new(
                field_cache.clone(),
                collaborators.records.clone(),
                collaborators.evaluator.clone(),
            )
            .with_pool(WorkerPool::new(config.worker_pool_size), config.parallel_threshold)
            .with_timezone(config.default_timezone.clone()),
        );

        let mut record_service =
            RecordService::new(collaborators.records.clone(), calculator.clone(), transactions.clone());
        if let Some(notifier) = collaborators.notifier {
            record_service = record_service.with_notifier(notifier);
        }
        let records = Arc::new(record_service);

        let fields = FieldService::new(
            collaborators.fields.clone(),
            collaborators.schema,
            collaborators.evaluator,
            transactions,
        );

        let audit = Arc::new(AuditLogHandler::new());
        bus.register(Arc::new(CacheInvalidationHandler::new(field_cache.clone())));
        bus.register(Arc::new(RecalculationHandler::new(
            Arc::downgrade(&records),
            collaborators.fields,
            collaborators.records,
        )));
        bus.register(audit.clone());

        tracing::info!(
            "Engine ready: pool size {}, handlers {:?}",
            config.worker_pool_size,
            bus.handler_names()
        );

        Ok(Self {
            config,
            bus,
            field_cache,
            calculator,
            records,
            fields,
            audit,
            memory: None,
            broadcaster: None,
        })
    }

    /// Engine over a fresh [`MemoryStore`], the built-in formula engine and a
    /// [`BroadcastNotifier`]
    pub fn in_memory(config: EngineConfig) -> Result<Self, EngineError> {
        let store = Arc::new(MemoryStore::new());
        let broadcaster = BroadcastNotifier::with_capacity(config.event_channel_capacity);

        let mut engine = Self::new(
            config,
            EngineCollaborators {
                fields: store.clone(),
                records: store.clone(),
                transactions: store.clone(),
                schema: store.clone(),
                evaluator: Arc::new(FormulaEngine::new()),
                notifier: Some(Arc::new(broadcaster.clone())),
            },
        )?;
        engine.memory = Some(store);
        engine.broadcaster = Some(broadcaster);
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn records(&self) -> &Arc<RecordService> {
        &self.records
    }

    pub fn fields(&self) -> &FieldService {
        &self.fields
    }

    pub fn calculator(&self) -> &Arc<CalculationService> {
        &self.calculator
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn field_cache(&self) -> &Arc<FieldCache> {
        &self.field_cache
    }

    pub fn audit_log(&self) -> &Arc<AuditLogHandler> {
        &self.audit
    }

    /// Backing store of an [`Engine::in_memory`] engine
    pub fn memory_store(&self) -> Option<&Arc<MemoryStore>> {
        self.memory.as_ref()
    }

    /// Real-time notifier of an [`Engine::in_memory`] engine
    pub fn broadcaster(&self) -> Option<&BroadcastNotifier> {
        self.broadcaster.as_ref()
    }

    /// Observe committed domain events
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.bus.subscribe()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("bus", &self.bus)
            .field("in_memory", &self.memory.is_some())
            .finish()
    }
}
