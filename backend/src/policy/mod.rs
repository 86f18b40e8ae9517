pub mod engine;
pub mod model;
pub mod price;
pub mod reason;
pub mod repository;
pub mod repository_sqlx;
