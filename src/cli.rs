use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "regdocs",
    version,
    about = "Regulatory PDF ingestion, semantic chunking and local retrieval"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Inventory(InventoryArgs),
    Ingest(IngestArgs),
    Query(QueryArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct InventoryArgs {
    #[arg(long, default_value = "data/pdfs")]
    pub pdf_dir: PathBuf,

    #[arg(long, default_value = ".cache/regdocs")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    #[arg(long, default_value = "data/pdfs")]
    pub pdf_dir: PathBuf,

    #[arg(long, default_value = ".cache/regdocs")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub ingest_manifest_path: Option<PathBuf>,

    /// Also write every segment produced in this run as JSON Lines.
    #[arg(long)]
    pub segments_path: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub force_rebuild: bool,

    #[arg(long, default_value_t = 1)]
    pub jobs: usize,

    #[arg(long)]
    pub max_pages_per_doc: Option<usize>,

    #[arg(long)]
    pub doc_timeout_secs: Option<u64>,

    #[arg(long, value_enum, default_value_t = TokenizerMode::Cl100kBase)]
    pub tokenizer: TokenizerMode,

    #[arg(long, value_enum, default_value_t = OcrMode::Auto)]
    pub ocr_mode: OcrMode,

    #[arg(long, default_value = "eng+deu")]
    pub ocr_lang: String,

    #[arg(long, default_value = crate::semantic::DEFAULT_MODEL_ID)]
    pub model_id: String,

    #[arg(long, default_value_t = 1024)]
    pub target_chunk_size: usize,

    #[arg(long, default_value_t = 1536)]
    pub max_chunk_size: usize,

    #[arg(long, default_value_t = 256)]
    pub chunk_overlap: usize,

    #[arg(long, default_value_t = 256)]
    pub min_chunk_size: usize,

    #[arg(long, default_value_t = 20)]
    pub min_block_length: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum OcrMode {
    Off,
    Auto,
}

impl OcrMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Auto => "auto",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum TokenizerMode {
    Cl100kBase,
    CharApprox,
}

impl TokenizerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cl100kBase => "cl100k-base",
            Self::CharApprox => "char-approx",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    #[arg(long, default_value = ".cache/regdocs")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub query: String,

    #[arg(long, default_value_t = 5)]
    pub limit: usize,

    #[arg(long, default_value = crate::semantic::DEFAULT_MODEL_ID)]
    pub model_id: String,

    #[arg(long)]
    pub document: Option<String>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/regdocs")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,
}
