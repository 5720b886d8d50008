//! termhub command-line client and daemon launcher

pub mod attach;
pub mod cli;
pub mod commands;
