use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, info, warn};

use super::chunk_builder::ChunkingConfig;
use super::document::{DocumentIngester, DocumentJob, DocumentOutcome, ingest_documents};
use super::ocr::{OcrEngine, TesseractOcr};
use super::page_source::PopplerOpener;
use super::store::{
    DB_SCHEMA_VERSION, DocRecord, DocState, DocStatus, clear_store, ensure_model_entry,
    load_doc_states, open_store, store_counts, write_document,
};
use super::tokenizer::{Tokenizer, build_tokenizer};
use crate::cli::{IngestArgs, OcrMode};
use crate::commands::inventory;
use crate::model::{
    ChunkingSettings, ContentKind, DocumentSummary, IngestCounts, IngestPaths, IngestRunManifest,
    PdfEntry, ToolVersions,
};
use crate::semantic::resolve_model_config;
use crate::util::{
    command_available, command_version_optional, ensure_directory, now_utc_string,
    utc_compact_string, write_json_lines, write_json_pretty,
};

const EMPTY_PAGE_SAMPLE: usize = 10;

pub fn run(args: IngestArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let config = chunking_config(&args);
    config
        .validate()
        .context("invalid chunking configuration")?;
    if args.jobs == 0 {
        bail!("--jobs must be at least 1");
    }

    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let inventory_manifest_path = inventory::default_manifest_path(&cache_root);
    let ingest_manifest_path = args.ingest_manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!(
            "ingest_run_{}.json",
            utc_compact_string(started_ts)
        ))
    });
    let db_path = default_db_path(&cache_root, args.db_path.as_ref());

    info!(
        pdf_dir = %args.pdf_dir.display(),
        cache_root = %cache_root.display(),
        run_id = %run_id,
        "starting ingest"
    );

    let inventory = inventory::build_manifest(&args.pdf_dir)?;
    write_json_pretty(&inventory_manifest_path, &inventory)?;
    let mut warnings = inventory.warnings.clone();

    let tool_versions = collect_tool_versions();
    let ocr = resolve_ocr_engine(args.ocr_mode, &mut warnings);
    let ocr_enabled = ocr.is_some();

    let mut connection = open_store(&db_path)?;
    if args.force_rebuild {
        clear_store(&connection)?;
        info!(db_path = %db_path.display(), "cleared segment store for rebuild");
    }
    let model = resolve_model_config(&args.model_id);
    ensure_model_entry(&connection, &model)?;

    let doc_states = load_doc_states(&connection)?;
    let plan = plan_jobs(&args.pdf_dir, &inventory.pdfs, &doc_states);
    info!(
        pending = plan.jobs.len(),
        resumed = plan.resumed,
        skipped = plan.skipped,
        "planned documents"
    );

    let mut ingester = DocumentIngester::new(config);
    if let Some(ocr) = ocr {
        ingester = ingester.with_ocr(ocr, args.ocr_lang.clone());
    }
    let opener = PopplerOpener {
        max_pages: args.max_pages_per_doc,
    };
    let jobs = plan
        .jobs
        .iter()
        .map(|planned| planned.job.clone())
        .collect::<Vec<DocumentJob>>();
    let timeout = args.doc_timeout_secs.map(Duration::from_secs);

    let outcomes = ingest_documents(
        &ingester,
        &opener,
        &jobs,
        args.tokenizer,
        args.jobs,
        timeout,
    )?;

    let mut counts = IngestCounts {
        pdf_count: inventory.pdf_count,
        skipped_pdf_count: plan.skipped,
        resumed_pdf_count: plan.resumed,
        ..IngestCounts::default()
    };
    let mut documents = Vec::<DocumentSummary>::with_capacity(outcomes.len());

    for (planned, outcome) in plan.jobs.iter().zip(&outcomes) {
        let status = document_status(outcome);
        let record = DocRecord {
            filename: &outcome.source_document,
            sha256: &planned.sha256,
            status,
            page_count: outcome.page_count,
            pages_completed: outcome.pages_completed,
            error: outcome.error.as_deref(),
        };
        let embedded = write_document(
            &mut connection,
            &record,
            &outcome.segments,
            outcome.start_page,
            &model,
        )?;

        tally_outcome(&mut counts, outcome, status);
        info!(
            pdf = %outcome.source_document,
            status = status.as_str(),
            pages = outcome.page_count,
            start_page = outcome.start_page,
            segments = outcome.segments.len(),
            embedded,
            "stored document"
        );

        if let Some(error) = &outcome.error {
            warnings.push(format!("{}: {error}", outcome.source_document));
        }
        documents.push(DocumentSummary {
            filename: outcome.source_document.clone(),
            status: status.as_str().to_string(),
            start_page: outcome.start_page,
            pages_completed: outcome.pages_completed,
            page_count: outcome.page_count,
            segments: outcome.segments.len(),
            empty_pages: outcome.empty_pages.clone(),
            failed_pages: outcome.failed_pages.clone(),
            error: outcome.error.clone(),
        });
    }

    if let Some(segments_path) = &args.segments_path {
        let written = write_json_lines(
            segments_path,
            outcomes.iter().flat_map(|outcome| outcome.segments.iter()),
        )?;
        info!(path = %segments_path.display(), segments = written, "wrote segments");
    }

    let totals = store_counts(&connection)?;
    counts.segments_total = totals.segments;
    counts.docs_total = totals.docs;

    let summary_tokenizer = build_tokenizer(args.tokenizer);
    log_run_summary(&outcomes, &counts, summary_tokenizer.as_ref());

    let status = if counts.failed_pdf_count > 0 {
        "completed_with_errors"
    } else {
        "completed"
    };
    let manifest = IngestRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        status: status.to_string(),
        started_at,
        updated_at: now_utc_string(),
        command: render_ingest_command(&args),
        tool_versions,
        paths: IngestPaths {
            pdf_dir: args.pdf_dir.display().to_string(),
            cache_root: cache_root.display().to_string(),
            manifest_dir: manifest_dir.display().to_string(),
            inventory_manifest_path: inventory_manifest_path.display().to_string(),
            db_path: db_path.display().to_string(),
            segments_path: args
                .segments_path
                .as_ref()
                .map(|path| path.display().to_string()),
        },
        chunking: ChunkingSettings {
            tokenizer: summary_tokenizer.name().to_string(),
            target_chunk_size: config.target_chunk_size,
            max_chunk_size: config.max_chunk_size,
            chunk_overlap: config.chunk_overlap,
            min_chunk_size: config.min_chunk_size,
            min_block_length: config.min_block_length,
            ocr_enabled,
            ocr_lang: args.ocr_lang.clone(),
        },
        counts,
        documents,
        warnings,
    };

    write_json_pretty(&ingest_manifest_path, &manifest)?;
    info!(path = %ingest_manifest_path.display(), "wrote ingest run manifest");
    info!(run_id = %run_id, status, "ingest completed");

    Ok(())
}

pub fn default_db_path(cache_root: &Path, db_path: Option<&PathBuf>) -> PathBuf {
    db_path
        .cloned()
        .unwrap_or_else(|| cache_root.join("regdocs.sqlite"))
}

pub(super) fn chunking_config(args: &IngestArgs) -> ChunkingConfig {
    ChunkingConfig {
        target_chunk_size: args.target_chunk_size,
        max_chunk_size: args.max_chunk_size,
        chunk_overlap: args.chunk_overlap,
        min_chunk_size: args.min_chunk_size,
        min_block_length: args.min_block_length,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct PlannedJob {
    pub job: DocumentJob,
    pub sha256: String,
}

#[derive(Debug, Default)]
pub(super) struct JobPlan {
    pub jobs: Vec<PlannedJob>,
    pub skipped: usize,
    pub resumed: usize,
}

/// Decides, per inventoried PDF, whether it is skipped, resumed after its last
/// completed page, or processed from page 1. Any hash change restarts the
/// document.
pub(super) fn plan_jobs(
    pdf_dir: &Path,
    pdfs: &[PdfEntry],
    doc_states: &HashMap<String, DocState>,
) -> JobPlan {
    let mut plan = JobPlan::default();

    for pdf in pdfs {
        let mut job = DocumentJob::new(pdf_dir.join(&pdf.filename), pdf.filename.clone());

        match doc_states.get(&pdf.filename) {
            Some(state) if state.sha256 == pdf.sha256 && state.status == DocStatus::Complete => {
                plan.skipped += 1;
                continue;
            }
            Some(state) if state.sha256 == pdf.sha256 && state.status == DocStatus::Partial => {
                job.start_page = state.pages_completed + 1;
                plan.resumed += 1;
                debug!(
                    pdf = %pdf.filename,
                    pages_completed = state.pages_completed,
                    page_count = state.page_count,
                    "resuming partial document"
                );
            }
            _ => {}
        }

        plan.jobs.push(PlannedJob {
            job,
            sha256: pdf.sha256.clone(),
        });
    }

    plan
}

fn document_status(outcome: &DocumentOutcome) -> DocStatus {
    if outcome.error.is_some() {
        DocStatus::Failed
    } else if outcome.is_complete() {
        DocStatus::Complete
    } else {
        DocStatus::Partial
    }
}

fn tally_outcome(counts: &mut IngestCounts, outcome: &DocumentOutcome, status: DocStatus) {
    match status {
        DocStatus::Failed => counts.failed_pdf_count += 1,
        DocStatus::Complete | DocStatus::Partial => counts.processed_pdf_count += 1,
    }
    if outcome.timed_out {
        counts.timed_out_pdf_count += 1;
    }
    if outcome.error.is_none() && outcome.segments.is_empty() {
        counts.empty_pdf_count += 1;
    }

    counts.pages_processed += outcome
        .pages_completed
        .saturating_sub(outcome.start_page.saturating_sub(1)) as usize;
    counts.empty_page_count += outcome.empty_pages.len();
    counts.failed_page_count += outcome.failed_pages.len();
    counts.image_failures += outcome.image_failures;

    for segment in &outcome.segments {
        match segment.content_kind {
            ContentKind::Text => counts.text_segments += 1,
            ContentKind::Image => counts.image_segments += 1,
        }
    }
}

fn resolve_ocr_engine(mode: OcrMode, warnings: &mut Vec<String>) -> Option<Box<dyn OcrEngine>> {
    match mode {
        OcrMode::Off => None,
        OcrMode::Auto => {
            let missing = ["tesseract", "pdfimages"]
                .into_iter()
                .filter(|program| !command_available(program))
                .collect::<Vec<&str>>();

            if missing.is_empty() {
                Some(Box::new(TesseractOcr))
            } else {
                let warning = format!(
                    "image OCR disabled, missing tools: {}",
                    missing.join(", ")
                );
                warn!(missing = ?missing, "image OCR disabled");
                warnings.push(warning);
                None
            }
        }
    }
}

fn collect_tool_versions() -> ToolVersions {
    ToolVersions {
        pdftohtml: command_version_optional("pdftohtml", &["-v"]),
        pdfimages: command_version_optional("pdfimages", &["-v"]),
        tesseract: command_version_optional("tesseract", &["--version"]),
    }
}

fn log_run_summary(outcomes: &[DocumentOutcome], counts: &IngestCounts, tokenizer: &dyn Tokenizer) {
    let segments = outcomes
        .iter()
        .flat_map(|outcome| outcome.segments.iter())
        .collect::<Vec<_>>();

    let (average_tokens, titled_share) = if segments.is_empty() {
        (0.0, 0.0)
    } else {
        let total_tokens = segments
            .iter()
            .map(|segment| tokenizer.count(&segment.text))
            .sum::<usize>();
        let titled = segments
            .iter()
            .filter(|segment| segment.title.is_some())
            .count();
        (
            total_tokens as f64 / segments.len() as f64,
            titled as f64 / segments.len() as f64,
        )
    };

    info!(
        processed = counts.processed_pdf_count,
        skipped = counts.skipped_pdf_count,
        resumed = counts.resumed_pdf_count,
        failed = counts.failed_pdf_count,
        timed_out = counts.timed_out_pdf_count,
        text_segments = counts.text_segments,
        image_segments = counts.image_segments,
        average_tokens = %format!("{average_tokens:.1}"),
        titled_share = %format!("{titled_share:.2}"),
        "ingest summary"
    );

    let empty_pages = outcomes
        .iter()
        .flat_map(|outcome| {
            outcome
                .empty_pages
                .iter()
                .map(move |page| format!("{}:{}", outcome.source_document, page))
        })
        .collect::<Vec<String>>();
    if !empty_pages.is_empty() {
        let sample = empty_pages
            .iter()
            .take(EMPTY_PAGE_SAMPLE)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        warn!(
            empty_pages = empty_pages.len(),
            sample = %sample,
            "pages produced no segments"
        );
    }
}

pub(super) fn render_ingest_command(args: &IngestArgs) -> String {
    let mut command = vec![
        "regdocs".to_string(),
        "ingest".to_string(),
        "--pdf-dir".to_string(),
        args.pdf_dir.display().to_string(),
        "--cache-root".to_string(),
        args.cache_root.display().to_string(),
    ];

    if let Some(path) = &args.db_path {
        command.push("--db-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.ingest_manifest_path {
        command.push("--ingest-manifest-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.segments_path {
        command.push("--segments-path".to_string());
        command.push(path.display().to_string());
    }
    if args.force_rebuild {
        command.push("--force-rebuild".to_string());
    }
    if args.jobs != 1 {
        command.push("--jobs".to_string());
        command.push(args.jobs.to_string());
    }
    if let Some(max_pages) = args.max_pages_per_doc {
        command.push("--max-pages-per-doc".to_string());
        command.push(max_pages.to_string());
    }
    if let Some(timeout) = args.doc_timeout_secs {
        command.push("--doc-timeout-secs".to_string());
        command.push(timeout.to_string());
    }

    command.push("--tokenizer".to_string());
    command.push(args.tokenizer.as_str().to_string());
    command.push("--ocr-mode".to_string());
    command.push(args.ocr_mode.as_str().to_string());
    if args.ocr_mode != OcrMode::Off {
        command.push("--ocr-lang".to_string());
        command.push(args.ocr_lang.clone());
    }

    command.push("--model-id".to_string());
    command.push(args.model_id.clone());
    for (flag, value) in [
        ("--target-chunk-size", args.target_chunk_size),
        ("--max-chunk-size", args.max_chunk_size),
        ("--chunk-overlap", args.chunk_overlap),
        ("--min-chunk-size", args.min_chunk_size),
        ("--min-block-length", args.min_block_length),
    ] {
        command.push(flag.to_string());
        command.push(value.to_string());
    }

    command.join(" ")
}
