use std::io::{self, Write};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::QueryArgs;
use crate::commands::ingest::default_db_path;
use crate::commands::ingest::store::{ScoredSegment, open_existing_store, top_k_segments};
use crate::model::ContentKind;
use crate::semantic::{embed_text_local, normalize_whitespace, resolve_model_config};

const SNIPPET_CHARS: usize = 240;

#[derive(Debug, Serialize)]
struct QueryResponse {
    query: String,
    limit: usize,
    returned: usize,
    model_id: String,
    document_filter: Option<String>,
    query_duration_ms: f64,
    results: Vec<QueryResult>,
}

#[derive(Debug, Serialize)]
struct QueryResult {
    rank: usize,
    segment_id: String,
    source_document: String,
    page_number: u32,
    ordinal_index: u32,
    content_kind: ContentKind,
    title: Option<String>,
    score: f64,
    text: String,
}

pub fn run(args: QueryArgs) -> Result<()> {
    let query_started = Instant::now();
    let query_text = normalize_whitespace(&args.query);
    if query_text.is_empty() {
        bail!("query must not be empty");
    }
    if args.limit == 0 {
        bail!("--limit must be at least 1");
    }

    let db_path = default_db_path(&args.cache_root, args.db_path.as_ref());
    let connection = open_existing_store(&db_path)?;
    let model = resolve_model_config(&args.model_id);

    let query_vector = embed_text_local(&query_text, model.dimensions);
    let hits = top_k_segments(
        &connection,
        &model,
        &query_vector,
        args.limit,
        args.document.as_deref(),
    )?;

    if hits.is_empty() {
        warn!(
            model_id = %model.model_id,
            db_path = %db_path.display(),
            "no embedded segments matched; ingest with the same --model-id first"
        );
    }

    let results = hits
        .into_iter()
        .enumerate()
        .map(|(index, hit)| to_query_result(index + 1, hit))
        .collect::<Vec<_>>();
    let query_duration_ms = query_started.elapsed().as_secs_f64() * 1000.0;

    info!(
        returned = results.len(),
        limit = args.limit,
        duration_ms = %format!("{query_duration_ms:.3}"),
        "query completed"
    );

    if args.json {
        write_json_response(QueryResponse {
            query: query_text,
            limit: args.limit,
            returned: results.len(),
            model_id: model.model_id,
            document_filter: args.document,
            query_duration_ms,
            results,
        })
    } else {
        write_text_response(&query_text, &results)
    }
}

fn to_query_result(rank: usize, hit: ScoredSegment) -> QueryResult {
    let segment = hit.segment;
    QueryResult {
        rank,
        segment_id: segment.segment_id(),
        source_document: segment.source_document,
        page_number: segment.page_number,
        ordinal_index: segment.ordinal_index,
        content_kind: segment.content_kind,
        title: segment.title,
        score: hit.score,
        text: segment.text,
    }
}

fn write_json_response(response: QueryResponse) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    serde_json::to_writer_pretty(&mut output, &response)
        .context("failed to serialize query json output")?;
    writeln!(output)?;
    output.flush()?;
    Ok(())
}

fn write_text_response(query_text: &str, results: &[QueryResult]) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());

    writeln!(output, "Query: {query_text}")?;
    writeln!(output, "Results: {}", results.len())?;

    for result in results {
        writeln!(
            output,
            "{}.\t{}\tpage {}\t{}\t{}",
            result.rank,
            result.source_document,
            result.page_number,
            result.content_kind.as_str(),
            result.title.as_deref().unwrap_or("(untitled)")
        )?;
        writeln!(
            output,
            "\tscore={:.6} segment_id={}",
            result.score, result.segment_id
        )?;
        writeln!(output, "\tsnippet: {}", snippet(&result.text))?;
    }

    output.flush()?;
    Ok(())
}

fn snippet(text: &str) -> String {
    let flattened = normalize_whitespace(text);
    if flattened.chars().count() <= SNIPPET_CHARS {
        return flattened;
    }
    let mut cut = flattened.chars().take(SNIPPET_CHARS).collect::<String>();
    cut.push_str("...");
    cut
}
