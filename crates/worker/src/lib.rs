//! Composition root for the notification worker process.

pub mod app;
