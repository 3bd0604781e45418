// Library exports for the tenantd supervisor

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod logs;
pub mod notify;
pub mod process;
pub mod store;
