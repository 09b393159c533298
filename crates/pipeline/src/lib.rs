//! Job orchestration: the status table, the generation worker that
//! drives a request through the pipeline backend, and the bounded pool
//! that runs workers off the request path.

pub mod backend;
pub mod pool;
pub mod status_table;
pub mod workflow;
pub mod worker;
