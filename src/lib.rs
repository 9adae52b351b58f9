pub mod app;
pub mod archive;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod jobs;
pub mod library;
pub mod output;
pub mod progress;
pub mod store;
pub mod table;
pub mod worker;
