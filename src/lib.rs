pub mod agents;
pub mod app;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod orchestration;
pub mod resilience;
pub mod shared;
pub mod state;
pub mod trust;
