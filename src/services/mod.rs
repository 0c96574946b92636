pub mod entity_store;
pub mod job_registry;
pub mod metrics_recorder;
pub mod query_facade;
pub mod sync_engine;
pub mod version_ledger;
