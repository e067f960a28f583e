//! OData feed to SQL replication engine.
//!
//! Jobs are described by YAML files: one feed service, one target database,
//! a set of tables to mirror. [`sync::run_job_file`] drives a single file
//! end to end.
pub mod atom;
pub mod config;
pub mod executor;
pub mod feed;
pub mod model;
pub mod pager;
pub mod schema;
pub mod statements;
pub mod sync;
pub mod windows;
