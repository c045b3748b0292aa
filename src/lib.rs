pub mod config;
pub mod error;
pub mod executor;
pub mod scheduler;
pub mod shutdown;
pub mod storage;
pub mod worker;
