//! Controller module for the migration operator.
//!
//! Contains the reconcilers, task engines, error handling, and shared
//! context.
//!
//! Four controllers run in the same process, each serialized per owner
//! resource by its work queue:
//! - MigMigration (the multi-phase migration task engine)
//! - DirectVolumeMigration (rsync transfer between clusters)
//! - DirectVolumeMigrationProgress (rsync log tailing and progress)
//! - DirectImageMigration (registry-to-registry image streams)

// Shared modules
pub mod context;
pub mod error;

// Controllers
pub mod analytic;
pub mod dim;
pub mod dvm;
pub mod dvm_progress;
pub mod migration;
