pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod server;

pub use error::ApiError;
pub use rate_limit::RateLimiter;
pub use server::{create_router, serve, AppState};
