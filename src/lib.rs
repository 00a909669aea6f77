pub mod commands;
pub mod error;
pub mod monitor;
mod runtime;
pub mod state;

pub use runtime::run;
