pub mod agents;
pub mod auxiliary;
pub mod git;
pub mod terminal;
pub mod workdir;
