//! db-copilot - AI-assisted database copilot.
//!
//! A chat backend that streams AI responses over SSE, turns proposed queries
//! into tracked proposals, and runs the approved ones against user-configured
//! PostgreSQL, SQLite and MongoDB databases.

pub mod api;
pub mod app;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod safety;
pub mod store;
pub mod stream;
