//! PostgreSQL-to-PostgreSQL table migration engine.
//!
//! Given a job spec naming a source and target connection and an ordered list
//! of per-table replication rules, this crate introspects the source catalog,
//! replays schema onto the target, and replicates row data using one of four
//! strategies: schema-only, overwrite, upsert, or insert-ignore.

pub mod config;
pub mod coordinator;
pub mod data_replicate;
pub mod ddl;
pub mod error;
pub mod introspect;
pub mod job_store;
pub mod pool;
pub mod type_prep;
pub mod types;

pub use coordinator::run;
pub use error::EngineError;
pub use job_store::JobStore;
pub use types::{
    ColumnDescriptor, ConnectionSpec, ConstraintDescriptor, IndexDescriptor, JobRecord, JobSpec,
    LogEvent, LogLevel, Rule, SequenceDescriptor, TableResult, TableTask,
};
