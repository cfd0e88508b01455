pub mod cleanup;
pub mod clock;
pub mod common;
pub mod config;
pub mod directory;
pub mod error;
pub mod health;
pub mod host;
pub mod job;
pub mod jobs;
pub mod load;
pub mod ranking;
pub mod service;
pub mod statistics;
pub mod store;
