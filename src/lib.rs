pub mod backfill;
pub mod calendar_sync;
pub mod commands;
pub mod db;
pub mod domain;
pub mod error;
pub mod google_api;
pub mod matcher;
mod migrations;
pub mod next_call;
pub mod processor;
pub mod repository;
pub mod state;
pub mod task_queue;
pub mod types;
