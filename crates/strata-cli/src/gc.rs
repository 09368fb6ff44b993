//! # Garbage Collection
//!
//! Reclaims blocks no key references and reports keys whose blocks are gone.
//! Corrupt keys are listed but never deleted; removing them is left to the
//! operator (`strata rm KEY`).

use std::process::ExitCode;

use anyhow::{Context, Result};
use console::style;
use strata_config::{log_cli_info, log_gc_warn};
use strata_kv::KvStore;
use strata_store::StoreError;

pub fn run(kv: &KvStore) -> Result<ExitCode> {
    println!();
    println!("  Strata Garbage Collection");
    println!("  =========================");

    match kv.clean() {
        Ok(stats) => {
            println!();
            println!("  Keys scanned:     {}", format_number(stats.nodes));
            println!("  Live blocks:      {}", format_number(stats.live_blocks));
            println!(
                "  Removed blocks:   {}",
                style(format_number(stats.removed_blocks)).green()
            );
            if stats.removed_temp > 0 {
                println!(
                    "  Stale temp files: {}",
                    format_number(stats.removed_temp)
                );
            }
            log_cli_info!("Clean complete", removed_blocks = stats.removed_blocks);
            Ok(ExitCode::SUCCESS)
        }
        Err(StoreError::CorruptNodes { keys }) => {
            log_gc_warn!("Corrupt keys found", count = keys.len());
            println!();
            println!(
                "  {} {} corrupt key(s) found:",
                style("!").red().bold(),
                keys.len()
            );
            for key in &keys {
                println!("      {}", key);
            }
            println!();
            println!("  Unreferenced blocks were still removed.");
            println!("  Corrupt keys were left in place; remove them with `strata rm KEY`.");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).context("Clean failed"),
    }
}

/// Format number with comma separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Format bytes as a human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
