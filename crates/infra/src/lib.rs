//! Infrastructure layer: job scheduling, cache, session tokens, Postgres and
//! configuration.

pub mod cache;
pub mod config;
pub mod db;
pub mod jobs;
pub mod tokens;
