//! # workbatch
//!
//! Concurrent, crash-resumable batch runner for an external code-agent tool.
//!
//! A [`Pipeline`](engine::Pipeline) discovers work items, turns each into
//! stdin for the tool and interprets what comes back. The
//! [`Scheduler`](engine::Scheduler) runs items through a bounded pool with
//! per-attempt timeouts and exponential-backoff retries, and writes every
//! state change through to a JSON task store so an interrupted batch can be
//! resumed where it stopped.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod job;
pub mod model;
pub mod progress;
pub mod storage;
pub mod telemetry;
pub mod worker;
