pub mod config;
pub mod types;

pub use config::FlowgridConfig;
pub use types::*;
