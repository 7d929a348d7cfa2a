#![cfg(feature = "storage-rocksdb")]

mod common;

use assert_cmd::cargo_bin;
use common::*;
use std::io::Write;
use std::process::Command;
use tempfile::tempdir;

fn run(db_path: &std::path::Path, lines: &[String]) -> String {
    let mut input = tempfile::NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(input, "{line}").unwrap();
    }
    let output = Command::new(cargo_bin!("orderpay"))
        .arg(input.path())
        .arg("--db-path")
        .arg(db_path)
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success());
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_rocksdb_persistence_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    // 1. First run: create and pay an order
    let stdout1 = run(
        &db_path,
        &[
            r#"{"type": "create_order", "order": 1, "currency": "EUR", "lines": [{"product": "tea", "quantity": 2, "unit_price": "50.00"}]}"#.to_string(),
            r#"{"type": "pay", "order": 1, "processor": "gateway_a", "key": "k1"}"#.to_string(),
        ],
    );
    assert!(stdout1.contains("1,paid,EUR,100.00,100.00,0.00,1"));

    // 2. Second run on the same DB: replay the pay, then the gateway reports
    // a refund of the persisted payment
    let (payload, signature) =
        card_callback("refund.succeeded", "gateway_a-1", Some(2500), Some("rf-1"));
    let refund = callback_command(CARD, &payload, &signature);
    let stdout2 = run(
        &db_path,
        &[
            r#"{"type": "pay", "order": 1, "processor": "gateway_a", "key": "k1"}"#.to_string(),
            refund.clone(),
        ],
    );
    assert!(stdout2.contains("1,partially_refunded,EUR,100.00,100.00,25.00,2"));

    // 3. Third run: the redelivered refund is recognised as already applied
    let stdout3 = run(&db_path, &[refund]);
    assert!(stdout3.contains("1,partially_refunded,EUR,100.00,100.00,25.00,2"));
}
