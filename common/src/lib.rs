// Common library shared by the API server: scheduler, notification bus and
// their ambient stack

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod registry;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod telemetry;
