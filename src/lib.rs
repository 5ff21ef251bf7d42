//! Gostly - supervisor and router for gost proxy workers
//!
//! This library provides:
//! - A process supervisor that starts and stops one gost worker per profile
//! - Structured capture and classification of worker output
//! - An audit timeline of administrative actions
//! - A Host header based reverse proxy router driven by a mapping table
//! - SQLite persistence for profiles, host mappings and activity history
//! - A JSON control API for the management front end

pub mod admin;
pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod handler;
pub mod logs;
pub mod pool;
pub mod resolver;
pub mod router;
pub mod supervisor;
pub mod timeline;
pub mod worker_config;
