//! Domain model: money, orders, payments, callbacks and receipts, plus the
//! ports the application layer talks to.

pub mod callback;
pub mod money;
pub mod order;
pub mod payment;
pub mod ports;
pub mod processor;
pub mod receipt;
