pub mod artifact;
pub mod audit;
pub mod binder;
pub mod config;
pub mod errors;
pub mod launcher;
pub mod logging;
pub mod pipeline;
pub mod settings;
pub mod step;
pub mod ui;
