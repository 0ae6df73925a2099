//! gleaner — background feed ingestion and AI-summarization service.
//!
//! Three subsystems around one embedded store: a concurrency-bounded
//! [`fetch::FetchScheduler`] that polls feed sources with conditional
//! requests and backoff, a supervised [`summarize::SummaryPool`] that pushes
//! articles through load-balanced local inference endpoints, and the
//! [`storage::Database`] — a SQLite file with a trigger-maintained full-text
//! index and an explicit article lifecycle. [`service::Service`] is the
//! command surface a UI drives; [`orchestrator::Orchestrator`] runs the
//! periodic fetch → summarize → retention cycle.

pub mod config;
pub mod fetch;
pub mod orchestrator;
pub mod service;
pub mod storage;
pub mod summarize;
pub mod util;
