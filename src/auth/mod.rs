pub mod handler;
pub mod jwt;

pub use handler::*;
pub use jwt::*;
