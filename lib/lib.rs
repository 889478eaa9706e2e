pub mod adapter;
pub mod availability;
pub mod build_info;
pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod logging;
pub mod markers;
pub mod pipeline;
pub mod queue;
pub mod server;
pub mod state;
