pub mod alerts;
pub mod broker;
pub mod config;
pub mod discord;
pub mod probe;
pub mod scheduler;
pub mod sweep;
pub mod util;
