//! Application layer orchestrating orders, payments and gateway callbacks.
//!
//! `PaymentEngine` is the entry point. The other modules are the pieces it
//! wires together: payment creation, gateway call policy, callback ingestion,
//! order synchronization and receipt issuance.

pub mod builder;
pub mod callbacks;
pub mod engine;
pub mod gateway_call;
pub mod order_sync;
pub mod receipts;
pub mod registry;
pub mod settlement;
