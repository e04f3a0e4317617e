pub mod api;
pub mod artifact;
pub mod collab;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod node;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod worker;
