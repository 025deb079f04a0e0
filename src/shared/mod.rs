pub mod path_env;
pub mod process;
