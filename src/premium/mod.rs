pub mod features;
pub mod manager;
pub mod models;
