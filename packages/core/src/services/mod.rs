//! Business Services
//!
//! This module contains the engine's services:
//!
//! - `CalculationService` - Orders and computes a record's computed fields
//! - `RecordService` - Record mutations with recompute, versioning and events
//! - `FieldService` - Field definition changes with reference and cycle checks
//! - `EventBus` - Post-commit dispatch to prioritized handlers
//! - `Engine` - Wires the collaborators and built-in handlers together
//!
//! Services coordinate between the store traits in [`crate::db`] and the pure
//! graph and calculator layers, and never hold locks across a store call.

pub mod calculation_service;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod field_cache;
pub mod field_service;
pub mod handlers;
pub mod realtime;
pub mod record_service;

pub use calculation_service::{CalculationOutcome, CalculationService, FieldFailure};
pub use engine::{Engine, EngineCollaborators};
pub use error::EngineError;
pub use event_bus::{EventBus, EventHandler, DEFAULT_HANDLER_PRIORITY};
pub use field_cache::{FieldCache, FieldCacheStats};
pub use field_service::FieldService;
pub use handlers::{
    AuditEntry, AuditLogHandler, CacheInvalidationHandler, RecalculationHandler, MAX_CASCADE_DEPTH,
};
pub use realtime::{BroadcastNotifier, RealtimeAction, RealtimeMessage, RealtimeNotifier};
pub use record_service::{RecordService, WriteOptions, SYSTEM_ACTOR};
