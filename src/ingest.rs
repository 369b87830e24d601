//! `ragline ingest`: chunk a text file and index it for one tenant.
//!
//! The file is split with [`chunk_text`], embedded, and upserted through the
//! same [`Orchestrator::ingest`] path the HTTP endpoint uses, so the
//! tenant's cached answers are purged when anything changed.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::chunk::chunk_text;
use crate::orchestrator::Orchestrator;

pub struct IngestOptions<'a> {
    pub tenant: &'a str,
    /// Defaults to the file stem.
    pub document_id: Option<&'a str>,
    pub max_chars: usize,
    pub dry_run: bool,
}

pub async fn run_ingest(orchestrator: &Orchestrator, path: &Path, opts: IngestOptions<'_>) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let document_id = match opts.document_id {
        Some(id) => id.to_string(),
        None => document_id_for(path)?,
    };

    let chunks = chunk_text(&document_id, &text, opts.max_chars);
    if chunks.is_empty() {
        bail!("{} contains no text", path.display());
    }

    if opts.dry_run {
        println!("ingest {} (dry-run)", document_id);
        println!("  tenant: {}", opts.tenant);
        println!("  chunks: {}", chunks.len());
        return Ok(());
    }

    let report = orchestrator
        .ingest(opts.tenant, chunks)
        .await
        .with_context(|| format!("Failed to index {}", document_id))?;

    println!("ingest {}", document_id);
    println!("  tenant: {}", opts.tenant);
    println!("  inserted: {}", report.inserted);
    println!("  superseded: {}", report.superseded);
    println!("  unchanged: {}", report.unchanged);
    println!("ok");
    Ok(())
}

fn document_id_for(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("cannot derive a document id from {}; pass --document", path.display()))
}
