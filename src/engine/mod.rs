// ClubMerge Engine - Core module structure
pub mod config;
pub mod database;
pub mod migrations;
pub mod rbac;
pub mod directory;
pub mod aggregation;
pub mod audit;
pub mod merge;
pub mod api;
pub mod cli;

pub use config::Config;
pub use database::Database;
pub use merge::MergeEngine;
