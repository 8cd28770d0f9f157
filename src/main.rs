//! dealsync daemon and one-shot commands.
//!
//! Usage:
//!   dealsync [run]              start the poller and job workers
//!   dealsync sync [USER_ID...]  sync the given users (all when omitted) and exit
//!   dealsync status USER_ID     print a user's sync checkpoint

use std::process::ExitCode;

use dealsync_lib::commands;
use dealsync_lib::db::PipelineDb;
use dealsync_lib::error::ErrorResponse;
use dealsync_lib::google_api::GOOGLE_PROVIDER;
use dealsync_lib::state::{load_config, PipelineState};
use dealsync_lib::types::Config;

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("Failed to serialize output: {}", e),
    }
}

async fn run_daemon(config: Config) -> ExitCode {
    let state = match PipelineState::from_config(config) {
        Ok(state) => state,
        Err(e) => {
            log::error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    log::info!("dealsync started");
    match state.spawn_background().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Worker stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_sync(config: Config, user_ids: &[String]) -> ExitCode {
    let state = match PipelineState::from_config(config) {
        Ok(state) => state,
        Err(e) => {
            print_json(&ErrorResponse::from(&e));
            return ExitCode::FAILURE;
        }
    };

    let users = if user_ids.is_empty() {
        match state.calendar.user_ids() {
            Ok(users) => users,
            Err(e) => {
                print_json(&ErrorResponse::from(&e));
                return ExitCode::FAILURE;
            }
        }
    } else {
        user_ids.to_vec()
    };

    let mut failed = false;
    for user_id in &users {
        match commands::trigger_sync(&state, user_id).await {
            Ok(response) => print_json(&response),
            Err(err) => {
                failed = true;
                print_json(&err);
            }
        }
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run_status(config: &Config, user_id: &str) -> ExitCode {
    let db = PipelineDb::resolve_path(config.db_path.as_deref())
        .and_then(|path| PipelineDb::open_readonly_at(&path));
    let db = match db {
        Ok(db) => db,
        Err(e) => {
            log::error!("Could not open database: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match db.get_sync_state(user_id, GOOGLE_PROVIDER) {
        Ok(Some(state)) => {
            print_json(&state);
            ExitCode::SUCCESS
        }
        Ok(None) => {
            eprintln!("No sync has run for {}", user_id);
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("Could not read sync state: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("run") => run_daemon(config).await,
        Some("sync") => run_sync(config, &args[1..]).await,
        Some("status") => match args.get(1) {
            Some(user_id) => run_status(&config, user_id),
            None => {
                eprintln!("usage: dealsync status USER_ID");
                ExitCode::FAILURE
            }
        },
        Some(other) => {
            eprintln!("unknown command: {}", other);
            eprintln!("usage: dealsync [run | sync [USER_ID...] | status USER_ID]");
            ExitCode::FAILURE
        }
    }
}
