pub mod server;

pub use server::{generate_token, AuxiliaryConfig, AuxiliaryServer, ServerStatus};
