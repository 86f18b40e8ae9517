pub mod api;
pub mod assignment;
pub mod clients;
pub mod config;
pub mod context;
pub mod db;
pub mod history;
pub mod lock;
pub mod metrics;
pub mod policy;
pub mod requests;
pub mod tasks;

pub mod error;
pub mod logger;
pub mod time;
