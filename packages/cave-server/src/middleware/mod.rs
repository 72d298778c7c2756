// HTTP middleware
pub mod auth;
pub mod rate_limit;

pub use auth::*;
pub use rate_limit::*;
