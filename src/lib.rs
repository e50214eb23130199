use std::sync::Arc;

use config::Config;
use database::Store;

pub mod chat;
pub mod codes;
pub mod config;
pub mod database;
pub mod error;
pub mod middleware;
pub mod permission;
pub mod quota;
pub mod utils;

pub mod routes;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Config,
}
