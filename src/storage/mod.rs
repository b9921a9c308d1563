//! Persistence: SQLite for profiles and usage, a JSON file for local settings

mod db;
mod local;

pub use db::Database;
pub use local::LocalStorage;
