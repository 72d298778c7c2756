// HTTP routes
pub mod health;
pub mod registry;
pub mod tome;

pub use health::*;
pub use registry::*;
pub use tome::*;
