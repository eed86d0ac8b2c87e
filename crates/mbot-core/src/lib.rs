//! Bot login core: configuration, device identity, authorization strategies and the login
//! driver that pulls decisions out of them through an on-demand channel.

pub mod auth;
pub mod config;
pub mod device;
pub mod domain;
pub mod errors;
pub mod exceptions;
pub mod logging;
pub mod sso;

pub use errors::{Error, Result};
