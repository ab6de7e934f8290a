pub mod auth;
pub mod blob;
pub mod catalog;
pub mod config;
pub mod credentials;
pub mod error;
pub mod files;
pub mod models;
pub mod routes;
pub mod search;
pub mod token;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use routes::{router, AppState};
