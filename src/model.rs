use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Image,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            _ => None,
        }
    }
}

/// One retrievable unit of document text.
///
/// `ordinal_index` is the segment's position among the segments of its page
/// and restarts at 0 on every page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub source_document: String,
    pub page_number: u32,
    pub ordinal_index: u32,
    pub text: String,
    pub title: Option<String>,
    pub content_kind: ContentKind,
}

impl Segment {
    pub fn segment_id(&self) -> String {
        format!(
            "{}:p{:04}:{:03}",
            self.source_document, self.page_number, self.ordinal_index
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfEntry {
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfInventoryManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub source_directory: String,
    pub pdf_count: usize,
    pub pdfs: Vec<PdfEntry>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolVersions {
    pub pdftohtml: Option<String>,
    pub pdfimages: Option<String>,
    pub tesseract: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestPaths {
    pub pdf_dir: String,
    pub cache_root: String,
    pub manifest_dir: String,
    pub inventory_manifest_path: String,
    pub db_path: String,
    pub segments_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingSettings {
    pub tokenizer: String,
    pub target_chunk_size: usize,
    pub max_chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
    pub min_block_length: usize,
    pub ocr_enabled: bool,
    pub ocr_lang: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestCounts {
    pub pdf_count: usize,
    pub processed_pdf_count: usize,
    pub skipped_pdf_count: usize,
    pub resumed_pdf_count: usize,
    pub failed_pdf_count: usize,
    pub timed_out_pdf_count: usize,
    pub empty_pdf_count: usize,
    pub pages_processed: usize,
    pub empty_page_count: usize,
    pub failed_page_count: usize,
    pub text_segments: usize,
    pub image_segments: usize,
    pub image_failures: usize,
    pub segments_total: i64,
    pub docs_total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub filename: String,
    pub status: String,
    pub start_page: u32,
    pub pages_completed: u32,
    pub page_count: u32,
    pub segments: usize,
    pub empty_pages: Vec<u32>,
    pub failed_pages: Vec<u32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub tool_versions: ToolVersions,
    pub paths: IngestPaths,
    pub chunking: ChunkingSettings,
    pub counts: IngestCounts,
    pub documents: Vec<DocumentSummary>,
    pub warnings: Vec<String>,
}
