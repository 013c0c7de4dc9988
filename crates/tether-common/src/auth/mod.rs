//! Connection token authentication

pub mod token;

pub use token::{AuthError, Claims, TokenService};
