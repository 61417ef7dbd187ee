//! binstar-build-worker — core library.
//!
//! Registers with a build-coordination service, pops queued build jobs,
//! renders and supervises a per-job build script, and streams a sectioned
//! log back to the server as the script runs.
pub mod buildlog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod generator_file;
pub mod job_loop;
pub mod line_splitter;
pub mod metadata;
pub mod model;
pub mod script_gen;
pub mod supervisor;
pub mod worker_context;
