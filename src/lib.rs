#![allow(missing_docs)] // TODO: enforce once the service API surface settles

//! Levelforge — leveling-guide ingestion pipeline.
//!
//! A company uploads a role/level competency matrix as a PDF. The pipeline
//! drives each guide through four phases — extract text, parse the matrix
//! with an LLM, fan out example generation per (competency, level) cell,
//! and finalize — on top of a durable SQLite task queue with at-least-once
//! delivery. An atomic compare-and-set claim on the guide status row is the
//! only synchronization point between workers.

pub mod config;
pub mod db;
pub mod errors;
pub mod llm;
pub mod logging;
pub mod pdf;
pub mod queue;
pub mod repos;
pub mod schemas;
pub mod service;
pub mod status;
pub mod storage;
pub mod tasks;
pub mod validations;
