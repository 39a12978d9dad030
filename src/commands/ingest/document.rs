use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::blocks::extract_blocks;
use super::chunk_builder::{ChunkingConfig, build_page_chunks};
use super::ocr::{OcrEngine, extract_image_texts};
use super::page_source::{DocumentOpener, PageSource};
use super::tokenizer::{Tokenizer, build_tokenizer};
use crate::cli::TokenizerMode;
use crate::model::{ContentKind, Segment};

pub struct DocumentIngester {
    pub config: ChunkingConfig,
    pub ocr: Option<Box<dyn OcrEngine>>,
    pub ocr_lang: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentJob {
    pub path: PathBuf,
    pub source_document: String,
    /// 1-based page to start from; earlier pages were stored by a previous run.
    pub start_page: u32,
}

impl DocumentJob {
    pub fn new(path: PathBuf, source_document: impl Into<String>) -> Self {
        Self {
            path,
            source_document: source_document.into(),
            start_page: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentOutcome {
    pub source_document: String,
    pub segments: Vec<Segment>,
    pub page_count: u32,
    pub start_page: u32,
    /// Highest page number fully processed, or `start_page - 1` if none.
    pub pages_completed: u32,
    pub empty_pages: Vec<u32>,
    pub failed_pages: Vec<u32>,
    pub image_failures: usize,
    pub timed_out: bool,
    pub error: Option<String>,
}

impl DocumentOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && !self.timed_out && self.pages_completed >= self.page_count
    }
}

#[derive(Debug, Default)]
struct PageResult {
    segments: Vec<Segment>,
    failed: bool,
    image_failures: usize,
}

impl DocumentIngester {
    pub fn new(config: ChunkingConfig) -> Self {
        Self {
            config,
            ocr: None,
            ocr_lang: "eng+deu".to_string(),
        }
    }

    pub fn with_ocr(mut self, ocr: Box<dyn OcrEngine>, ocr_lang: impl Into<String>) -> Self {
        self.ocr = Some(ocr);
        self.ocr_lang = ocr_lang.into();
        self
    }

    /// Ingests one document page by page. Open failures and the deadline are
    /// reported in the outcome; only pages finished before the deadline
    /// contribute segments.
    pub fn ingest_document(
        &self,
        opener: &dyn DocumentOpener,
        job: &DocumentJob,
        tokenizer: &dyn Tokenizer,
        timeout: Option<Duration>,
    ) -> DocumentOutcome {
        let started = Instant::now();
        let start_page = job.start_page.max(1);
        let mut outcome = DocumentOutcome {
            source_document: job.source_document.clone(),
            start_page,
            pages_completed: start_page - 1,
            ..DocumentOutcome::default()
        };

        let source = match opener
            .open(&job.path)
            .with_context(|| format!("failed to open {}", job.path.display()))
        {
            Ok(source) => source,
            Err(err) => {
                warn!(pdf = %job.source_document, error = %format!("{err:#}"), "document failed");
                outcome.error = Some(format!("{err:#}"));
                return outcome;
            }
        };

        outcome.page_count = u32::try_from(source.page_count()).unwrap_or(u32::MAX);

        for page_number in start_page..=outcome.page_count {
            // only checked between pages; the first page always runs
            let expired = timeout
                .filter(|limit| page_number > start_page && started.elapsed() >= *limit);
            if let Some(limit) = expired {
                warn!(
                    pdf = %job.source_document,
                    pages_completed = outcome.pages_completed,
                    page_count = outcome.page_count,
                    timeout_secs = limit.as_secs_f64(),
                    "document timed out, keeping completed pages"
                );
                outcome.timed_out = true;
                break;
            }

            let page = self.ingest_page(source.as_ref(), &job.source_document, page_number, tokenizer);
            if page.failed {
                outcome.failed_pages.push(page_number);
            } else if page.segments.is_empty() {
                outcome.empty_pages.push(page_number);
            }
            outcome.image_failures += page.image_failures;
            outcome.segments.extend(page.segments);
            outcome.pages_completed = page_number;
        }

        debug!(
            pdf = %job.source_document,
            pages = outcome.page_count,
            segments = outcome.segments.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "document ingested"
        );

        outcome
    }

    fn ingest_page(
        &self,
        source: &dyn PageSource,
        source_document: &str,
        page_number: u32,
        tokenizer: &dyn Tokenizer,
    ) -> PageResult {
        let page_index = (page_number - 1) as usize;
        let mut result = PageResult::default();

        match source.text_blocks(page_index) {
            Ok(raw_blocks) => {
                let blocks = extract_blocks(&raw_blocks);
                for chunk in build_page_chunks(&blocks, &self.config, tokenizer) {
                    result.segments.push(Segment {
                        source_document: source_document.to_string(),
                        page_number,
                        ordinal_index: 0,
                        text: chunk.text,
                        title: chunk.title,
                        content_kind: ContentKind::Text,
                    });
                }
            }
            Err(err) => {
                warn!(
                    pdf = %source_document,
                    page = page_number,
                    error = %format!("{err:#}"),
                    "page text extraction failed"
                );
                result.failed = true;
            }
        }

        if let Some(ocr) = self.ocr.as_deref() {
            let images = extract_image_texts(source, page_index, ocr, &self.ocr_lang);
            result.image_failures = images.failures;
            for image in images.texts {
                result.segments.push(Segment {
                    source_document: source_document.to_string(),
                    page_number,
                    ordinal_index: 0,
                    text: image.text,
                    title: Some(format!("Image {}", image.image_number)),
                    content_kind: ContentKind::Image,
                });
            }
        }

        for (ordinal, segment) in result.segments.iter_mut().enumerate() {
            segment.ordinal_index = ordinal as u32;
        }

        result
    }
}

/// Ingests a batch of documents, in parallel when `workers > 1`. Each worker
/// builds its own tokenizer; outcomes keep the order of `jobs`.
pub fn ingest_documents(
    ingester: &DocumentIngester,
    opener: &dyn DocumentOpener,
    jobs: &[DocumentJob],
    tokenizer_mode: TokenizerMode,
    workers: usize,
    timeout: Option<Duration>,
) -> Result<Vec<DocumentOutcome>> {
    ingest_documents_with(ingester, opener, jobs, workers, timeout, || {
        build_tokenizer(tokenizer_mode)
    })
}

/// Like [`ingest_documents`], with the tokenizer supplied by `make_tokenizer`.
/// It is called at most once per pool thread.
pub(super) fn ingest_documents_with<F>(
    ingester: &DocumentIngester,
    opener: &dyn DocumentOpener,
    jobs: &[DocumentJob],
    workers: usize,
    timeout: Option<Duration>,
    make_tokenizer: F,
) -> Result<Vec<DocumentOutcome>>
where
    F: Fn() -> Box<dyn Tokenizer> + Sync,
{
    if workers <= 1 || jobs.len() <= 1 {
        let tokenizer = make_tokenizer();
        return Ok(jobs
            .iter()
            .map(|job| ingester.ingest_document(opener, job, tokenizer.as_ref(), timeout))
            .collect());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|index| format!("regdocs-ingest-{index}"))
        .build()
        .context("failed to build ingest worker pool")?;

    info!(workers, documents = jobs.len(), "ingesting documents in parallel");

    // One slot per pool thread; a thread only ever locks its own slot.
    let slots = (0..pool.current_num_threads())
        .map(|_| Mutex::new(None))
        .collect::<Vec<Mutex<Option<Box<dyn Tokenizer>>>>>();

    let outcomes = pool.install(|| {
        jobs.par_iter()
            .map(|job| {
                let index = rayon::current_thread_index().unwrap_or_default() % slots.len();
                let mut slot = slots[index].lock().unwrap_or_else(PoisonError::into_inner);
                let tokenizer = slot.get_or_insert_with(&make_tokenizer);
                ingester.ingest_document(opener, job, &**tokenizer, timeout)
            })
            .collect::<Vec<DocumentOutcome>>()
    });

    Ok(outcomes)
}
