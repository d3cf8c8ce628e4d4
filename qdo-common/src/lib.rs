pub mod checkpoint;
pub mod health;
pub mod memory;
pub mod metrics;
pub mod partition;
pub mod queuey;
