//! runq: script run queue engine.
//!
//! Registered scripts are submitted as tasks: each submission is staged
//! into an isolated directory, admitted FIFO under a global concurrency
//! cap, run as a supervised subprocess, and cancellable before or during
//! execution.

pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod stager;
pub mod store;
pub mod task;
