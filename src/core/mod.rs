//! Core modules shared by every pipeline component.
//!
//! Storage access, configuration, time, logging and the crate error type
//! live here; the pipeline stages themselves live in [`crate::plugins`].

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod locks;
pub mod logging;
pub mod schemas;
pub mod store;
pub mod time;
