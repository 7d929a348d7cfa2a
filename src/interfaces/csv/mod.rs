pub mod order_writer;
pub mod receipt_writer;
