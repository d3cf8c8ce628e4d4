pub mod assignor;
pub mod config;
pub mod coordination;
pub mod error;
pub mod job;
pub mod partition;
pub mod worker;
