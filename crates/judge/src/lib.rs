//! Alert judge service: configuration, HTTP API and component wiring

pub mod api;
pub mod app;
pub mod config;
