pub mod app;
pub mod client;
pub mod config;
pub mod contracts;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod testing;
