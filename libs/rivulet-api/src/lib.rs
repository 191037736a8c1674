pub mod agent;
pub mod error;
pub mod record;
pub mod source;
