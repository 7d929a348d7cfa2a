//! Adapters between the engine and the outside world: the webhook endpoint,
//! the JSON-lines command feed and the CSV reports.

pub mod csv;
pub mod jsonl;
pub mod webhook;
