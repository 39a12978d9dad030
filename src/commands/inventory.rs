use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::cli::InventoryArgs;
use crate::model::{PdfEntry, PdfInventoryManifest};
use crate::util::{now_utc_string, sha256_file, write_json_pretty};

pub fn run(args: InventoryArgs) -> Result<()> {
    let manifest = build_manifest(&args.pdf_dir)?;

    if args.dry_run {
        info!(
            pdf_count = manifest.pdf_count,
            source = %manifest.source_directory,
            "inventory dry-run complete"
        );
        return Ok(());
    }

    let manifest_path = args
        .manifest_path
        .unwrap_or_else(|| default_manifest_path(&args.cache_root));

    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote inventory manifest");
    info!(pdf_count = manifest.pdf_count, "inventory completed");

    Ok(())
}

pub fn default_manifest_path(cache_root: &Path) -> PathBuf {
    cache_root.join("manifests").join("pdf_inventory.json")
}

/// Hashes every PDF directly inside `pdf_dir`. Files that cannot be read are
/// reported in `warnings` and left out rather than failing the inventory.
pub fn build_manifest(pdf_dir: &Path) -> Result<PdfInventoryManifest> {
    if !pdf_dir.is_dir() {
        bail!("PDF directory does not exist: {}", pdf_dir.display());
    }

    let mut pdf_paths = discover_pdfs(pdf_dir)?;
    pdf_paths.sort();

    if pdf_paths.is_empty() {
        warn!(path = %pdf_dir.display(), "no PDFs found");
    }

    let mut pdfs = Vec::with_capacity(pdf_paths.len());
    let mut warnings = Vec::<String>::new();
    for path in pdf_paths {
        let Some(filename) = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToOwned::to_owned)
        else {
            warnings.push(format!("skipping non UTF-8 filename: {}", path.display()));
            continue;
        };

        let entry = fs::metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))
            .and_then(|metadata| {
                let sha256 = sha256_file(&path)?;
                Ok(PdfEntry {
                    filename: filename.clone(),
                    size_bytes: metadata.len(),
                    sha256,
                })
            });

        match entry {
            Ok(entry) => pdfs.push(entry),
            Err(err) => {
                let warning = format!("failed to inventory {}: {err:#}", path.display());
                warn!(warning = %warning, "inventory warning");
                warnings.push(warning);
            }
        }
    }

    pdfs.sort_by(|a, b| a.filename.cmp(&b.filename));

    Ok(PdfInventoryManifest {
        manifest_version: 1,
        generated_at: now_utc_string(),
        source_directory: pdf_dir.display().to_string(),
        pdf_count: pdfs.len(),
        pdfs,
        warnings,
    })
}

fn discover_pdfs(pdf_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pdfs = Vec::new();

    let entries =
        fs::read_dir(pdf_dir).with_context(|| format!("failed to read {}", pdf_dir.display()))?;

    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", pdf_dir.display()))?;
        let path = entry.path();

        if !entry
            .file_type()
            .with_context(|| format!("failed to inspect file type: {}", path.display()))?
            .is_file()
        {
            continue;
        }

        let is_pdf = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);

        if is_pdf {
            pdfs.push(path);
        }
    }

    Ok(pdfs)
}
