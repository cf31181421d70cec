//! Process-local stand-ins for the job queue and the result store.

pub mod queue;
pub mod store;
