//! CLI command modules.

pub mod http;
pub mod run;
pub mod runs;
pub mod status;
