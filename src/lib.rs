//! Serve model predictions over HTTP, one isolated worker process per model.

pub mod web;
