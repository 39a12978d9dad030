mod blocks;
mod chunk_builder;
mod document;
mod ocr;
mod page_source;
mod run;
pub mod store;
mod tokenizer;

pub use run::{default_db_path, run};
