#![forbid(unsafe_code)]

//! Cluster plumbing shared by the chat instances and the dispatcher:
//! coordination-service identity claiming and registration, the shared
//! connection directory, and the partitioned outbound log.

pub mod directory;
pub mod discovery;
pub mod log;
