pub mod agent;
pub mod app;
pub mod config;
pub mod error;
pub mod policy;
pub mod router;
pub mod runtime;
pub mod source;
