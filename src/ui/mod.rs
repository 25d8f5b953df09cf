//! HTTP status endpoint

pub mod handlers;
pub mod server;

pub use handlers::{ApiResponse, SystemStatus};
pub use server::{AppState, WebServer};
