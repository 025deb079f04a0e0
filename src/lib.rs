#![deny(dead_code)]

pub mod api;
pub mod domains;
pub mod errors;
pub mod infrastructure;
pub mod registry;
pub mod router;
pub mod shared;

pub use errors::{ArborError, Result};
pub use registry::SessionRegistry;
