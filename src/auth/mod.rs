pub mod token;

pub use token::{TokenError, TokenVerifier};
