//! Domain layer shared by the HTTP server, storage and background workers.

pub mod money;
pub mod password;
pub mod totp;
pub mod types;
pub mod validation;

pub use money::{Amount, AmountError, Rate};
