mod common;

use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use common::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;

#[test]
fn test_cli_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!("orderpay"));
    cmd.arg("tests/fixtures/commands.jsonl");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "order,state,currency,total,captured,refunded,receipts",
        ))
        // Captured once despite the replayed callback, then partially refunded
        .stdout(predicate::str::contains(
            "1,partially_refunded,EUR,100.00,100.00,40.00,2",
        ))
        // Cancel after capture is refused
        .stdout(predicate::str::contains("2,paid,EUR,30.00,30.00,0.00,1"))
        .stdout(predicate::str::contains(
            "3,awaiting_payment,USD,10.00,5.00,0.00,1",
        ))
        .stdout(predicate::str::contains("4,cancelled,EUR,20.00,0.00,0.00,0"))
        .stderr(predicate::str::contains("Error reading command"))
        .stderr(predicate::str::contains("Error processing command"));

    Ok(())
}

#[test]
fn test_cli_redirect_flow_writes_receipts() -> Result<(), Box<dyn std::error::Error>> {
    let (capture, header) = redirect_callback("PAYMENT_CAPTURED", "gateway_b-1", 10000, None);
    let mut input = tempfile::NamedTempFile::new()?;
    writeln!(
        input,
        r#"{{"type": "create_order", "order": 7, "currency": "EUR", "lines": [{{"product": "tea", "quantity": 2, "unit_price": "30.00"}}, {{"product": "pot", "quantity": 1, "unit_price": "40.00"}}]}}"#
    )?;
    writeln!(
        input,
        r#"{{"type": "pay", "order": 7, "processor": "gateway_b", "key": "checkout-7"}}"#
    )?;
    writeln!(input, "{}", callback_command(REDIRECT, &capture, &header))?;

    let dir = tempfile::tempdir()?;
    let receipts_path = dir.path().join("receipts.csv");

    let mut cmd = Command::new(cargo_bin!("orderpay"));
    cmd.arg(input.path())
        .arg("--receipts-out")
        .arg(&receipts_path);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("7,paid,EUR,100.00,100.00,0.00,1"));

    let receipts = std::fs::read_to_string(&receipts_path)?;
    assert!(receipts.starts_with("receipt,order,payment,event,kind,currency,description"));
    assert!(receipts.contains(",sale,EUR,tea,2,30.00,60.00,100.00"));
    assert!(receipts.contains(",sale,EUR,pot,1,40.00,40.00,100.00"));
    Ok(())
}

#[test]
fn test_cli_missing_input_fails() {
    let mut cmd = Command::new(cargo_bin!("orderpay"));
    cmd.arg("tests/fixtures/does-not-exist.jsonl");
    cmd.assert().failure();
}

#[test]
fn test_cli_rejects_broken_config() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = tempfile::NamedTempFile::new()?;
    writeln!(config, "[engine\ngateway_timeout = ")?;

    let mut cmd = Command::new(cargo_bin!("orderpay"));
    cmd.arg("tests/fixtures/commands.jsonl")
        .arg("--config")
        .arg(config.path());
    cmd.assert().failure();
    Ok(())
}
