//! Build script for usmalloc.
//!
//! Prints hints about feature combinations that change runtime behavior.

use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_PARKING_LOT");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_DIAGNOSTICS");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_LOG");

    let parking_lot_enabled = env::var("CARGO_FEATURE_PARKING_LOT").is_ok();
    let diagnostics_enabled = env::var("CARGO_FEATURE_DIAGNOSTICS").is_ok();
    let log_enabled = env::var("CARGO_FEATURE_LOG").is_ok();

    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let is_release = profile == "release";

    if is_release && diagnostics_enabled {
        emit_warning("'diagnostics' enabled in a release build");
        emit_note("Pool and deferred-free events are written to stderr.");
        if !log_enabled {
            emit_note("Enable 'log' to route them through your logger instead.");
        }
    }

    if is_release && !parking_lot_enabled {
        emit_note("Tip: enable 'parking_lot' for a cheaper manager lock:");
        emit_note("  usmalloc = { version = \"0.1\", features = [\"parking_lot\"] }");
    }
}

fn emit_note(msg: &str) {
    println!("cargo:warning=[usmalloc]    {}", msg);
}

fn emit_warning(msg: &str) {
    println!("cargo:warning=[usmalloc] {}", msg);
}
