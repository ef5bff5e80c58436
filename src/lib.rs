// Public API for integration tests and the server binary

pub mod abuse;
pub mod api;
pub mod app;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod supervisor;
pub mod types;
pub mod ws;
