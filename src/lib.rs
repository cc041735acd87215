#![forbid(unsafe_code)]

pub mod app;
pub mod change;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod fetch;
pub mod logging;
pub mod model;
