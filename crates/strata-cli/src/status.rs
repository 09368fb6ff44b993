//! `strata status`: store statistics.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use console::style;
use serde::Serialize;
use strata_kv::KvStore;

use crate::gc::{format_bytes, format_number};

#[derive(Debug, Serialize)]
struct StatusReport {
    root: PathBuf,
    keys: u64,
    blocks: u64,
    block_bytes: u64,
    block_size: usize,
    compression: String,
}

pub fn run(kv: &KvStore, json: bool) -> Result<ExitCode> {
    let storage = kv.storage();
    let stats = kv.stats().context("Failed to collect store statistics")?;
    let report = StatusReport {
        root: storage.root().to_path_buf(),
        keys: stats.node_count,
        blocks: stats.block_count,
        block_bytes: stats.block_bytes,
        block_size: storage.config().block_size,
        compression: storage.config().compression.to_string(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!();
    println!("  {}", style("Strata Store").bold().cyan());
    println!("  {}", style("─".repeat(30)).dim());
    println!("  Root:        {}", report.root.display());
    println!("  Keys:        {}", format_number(report.keys));
    println!(
        "  Blocks:      {} ({})",
        format_number(report.blocks),
        format_bytes(report.block_bytes)
    );
    println!("  Block size:  {}", format_bytes(report.block_size as u64));
    println!("  Compression: {}", report.compression);
    Ok(ExitCode::SUCCESS)
}
