use std::fs;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::ingest::default_db_path;
use crate::commands::ingest::store::{open_existing_store, read_metadata, store_counts};
use crate::commands::inventory::default_manifest_path;
use crate::model::{IngestRunManifest, PdfInventoryManifest};
use crate::util::latest_file_with_prefix;

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.cache_root.join("manifests");
    let inventory_path = default_manifest_path(&args.cache_root);
    let db_path = default_db_path(&args.cache_root, args.db_path.as_ref());

    info!(cache_root = %args.cache_root.display(), "status requested");

    if inventory_path.exists() {
        let raw = fs::read(&inventory_path)
            .with_context(|| format!("failed to read {}", inventory_path.display()))?;
        let inventory: PdfInventoryManifest = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", inventory_path.display()))?;

        info!(
            generated_at = %inventory.generated_at,
            source = %inventory.source_directory,
            pdf_count = inventory.pdf_count,
            warnings = inventory.warnings.len(),
            "loaded inventory manifest"
        );
    } else {
        warn!(path = %inventory_path.display(), "inventory manifest missing");
    }

    match latest_file_with_prefix(&manifest_dir, "ingest_run_")? {
        Some(path) => {
            let raw =
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            let manifest: IngestRunManifest = serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;

            info!(
                run_id = %manifest.run_id,
                status = %manifest.status,
                started_at = %manifest.started_at,
                updated_at = %manifest.updated_at,
                tokenizer = %manifest.chunking.tokenizer,
                ocr_enabled = manifest.chunking.ocr_enabled,
                processed = manifest.counts.processed_pdf_count,
                skipped = manifest.counts.skipped_pdf_count,
                failed = manifest.counts.failed_pdf_count,
                timed_out = manifest.counts.timed_out_pdf_count,
                text_segments = manifest.counts.text_segments,
                image_segments = manifest.counts.image_segments,
                "last ingest run"
            );
        }
        None => warn!(path = %manifest_dir.display(), "no ingest run manifest found"),
    }

    if db_path.exists() {
        let connection = open_existing_store(&db_path)?;
        let counts = store_counts(&connection)?;
        let schema_version = read_metadata(&connection, "db_schema_version")?.unwrap_or_default();

        info!(
            path = %db_path.display(),
            schema_version = %schema_version,
            docs = counts.docs,
            complete = counts.complete_docs,
            partial = counts.partial_docs,
            failed = counts.failed_docs,
            segments = counts.segments,
            text_segments = counts.text_segments,
            image_segments = counts.image_segments,
            embeddings = counts.embeddings,
            "database status"
        );
    } else {
        warn!(path = %db_path.display(), "database file missing");
    }

    Ok(())
}
