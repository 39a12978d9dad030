use anyhow::{Result, bail};

use super::blocks::Block;
use super::tokenizer::Tokenizer;

/// Token budgets for merging content blocks into segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub target_chunk_size: usize,
    pub max_chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
    /// Minimum characters for a content block to be kept at all.
    pub min_block_length: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chunk_size: 1024,
            max_chunk_size: 1536,
            chunk_overlap: 256,
            min_chunk_size: 256,
            min_block_length: 20,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target_chunk_size == 0 {
            bail!("target chunk size must be greater than zero");
        }
        if self.chunk_overlap >= self.target_chunk_size {
            bail!(
                "chunk overlap ({}) must be smaller than the target chunk size ({})",
                self.chunk_overlap,
                self.target_chunk_size
            );
        }
        if self.target_chunk_size > self.max_chunk_size {
            bail!(
                "target chunk size ({}) must not exceed the max chunk size ({})",
                self.target_chunk_size,
                self.max_chunk_size
            );
        }
        if self.min_chunk_size > self.target_chunk_size {
            bail!(
                "min chunk size ({}) must not exceed the target chunk size ({})",
                self.min_chunk_size,
                self.target_chunk_size
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageChunk {
    pub text: String,
    pub title: Option<String>,
}

/// A kept content block with the title that was current when it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingBlock {
    title: Option<String>,
    text: String,
}

/// Walks one page's blocks in order. Blocks shorter than `min_block_length`
/// are dropped before classification, so a very short heading never becomes
/// the current title.
#[derive(Debug, Default)]
struct PageChunkState {
    current_title: Option<String>,
    pending: Vec<PendingBlock>,
}

impl PageChunkState {
    fn push(&mut self, block: &Block, min_block_length: usize) {
        let text = block.text.trim();
        if text.chars().count() < min_block_length {
            return;
        }

        if block.is_title {
            self.current_title = Some(text.to_string());
        } else {
            self.pending.push(PendingBlock {
                title: self.current_title.clone(),
                text: text.to_string(),
            });
        }
    }
}

/// Builds the text chunks of one page: all content blocks are merged up to
/// the target size with overlap, then anything above the max size is split.
pub fn build_page_chunks(
    blocks: &[Block],
    config: &ChunkingConfig,
    tokenizer: &dyn Tokenizer,
) -> Vec<PageChunk> {
    let mut state = PageChunkState::default();
    for block in blocks {
        state.push(block, config.min_block_length);
    }

    let mut chunks = Vec::<PageChunk>::new();
    for merged in merge_blocks_into_chunks(&state.pending, config, tokenizer) {
        if tokenizer.count(&merged.text) > config.max_chunk_size {
            let pieces = tokenizer.split_with_overlap(
                &merged.text,
                config.target_chunk_size,
                config.chunk_overlap,
            );
            chunks.extend(pieces.into_iter().map(|text| PageChunk {
                text,
                title: merged.title.clone(),
            }));
        } else {
            chunks.push(merged);
        }
    }

    chunks
}

/// Greedy merge of a page's content blocks. A closed chunk seeds the next
/// buffer with its last `chunk_overlap` tokens; an undersized remainder is
/// folded into the previous chunk without repeating that seed. Each chunk
/// takes the title of its first block after the seed.
fn merge_blocks_into_chunks(
    blocks: &[PendingBlock],
    config: &ChunkingConfig,
    tokenizer: &dyn Tokenizer,
) -> Vec<PageChunk> {
    let mut chunks = Vec::<PageChunk>::new();
    let mut seed: Option<String> = None;
    let mut pending = Vec::<&PendingBlock>::new();
    let mut buffer_tokens = 0usize;

    for block in blocks {
        let block_tokens = tokenizer.count(&block.text);

        if buffer_tokens > 0 && buffer_tokens + block_tokens > config.target_chunk_size {
            let closed = close_buffer(seed.as_deref(), &pending);
            let tail = tokenizer.tail(&closed.text, config.chunk_overlap);
            chunks.push(closed);

            buffer_tokens = tokenizer.count(&tail);
            seed = (!tail.trim().is_empty()).then_some(tail);
            pending.clear();
        }

        pending.push(block);
        buffer_tokens += block_tokens;
    }

    if pending.is_empty() {
        return chunks;
    }

    if buffer_tokens < config.min_chunk_size
        && let Some(previous) = chunks.last_mut()
    {
        previous.text.push(' ');
        previous.text.push_str(&join_texts(None, &pending));
        return chunks;
    }

    chunks.push(close_buffer(seed.as_deref(), &pending));
    chunks
}

fn close_buffer(seed: Option<&str>, pending: &[&PendingBlock]) -> PageChunk {
    PageChunk {
        text: join_texts(seed, pending),
        title: pending.first().and_then(|block| block.title.clone()),
    }
}

fn join_texts(seed: Option<&str>, pending: &[&PendingBlock]) -> String {
    let mut parts = Vec::with_capacity(pending.len() + 1);
    if let Some(seed) = seed {
        parts.push(seed.trim());
    }
    parts.extend(pending.iter().map(|block| block.text.as_str()));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::super::tokenizer::{BpeTokenizer, CharApproxTokenizer};
    use super::*;

    const SENTENCES: [&str; 8] = [
        "The enlargement must not exceed the height of the highest part of the existing roof.",
        "Materials used in exterior work must be of a similar appearance to those of the house.",
        "Where the extension is within two metres of the boundary the eaves must not exceed three metres.",
        "Any upper floor window in a side elevation must be obscure glazed and non opening.",
        "The total area of ground covered by buildings must not exceed half the curtilage.",
        "Development is not permitted if the house is on article two land.",
        "A single storey rear extension must not extend beyond the rear wall by more than four metres.",
        "Verandas, balconies and raised platforms are not permitted development.",
    ];

    const HEADINGS: [&str; 4] = [
        "Class A Enlargement of a dwellinghouse",
        "Class B Additions to the roof",
        "Class C Other alterations to the roof",
        "Class D Porches and entrances",
    ];

    fn content(text: String) -> Block {
        Block {
            text,
            font_size: 10.0,
            is_title: false,
        }
    }

    fn title(text: &str) -> Block {
        Block {
            text: text.to_string(),
            font_size: 16.0,
            is_title: true,
        }
    }

    fn untitled(texts: &[String]) -> Vec<PendingBlock> {
        texts
            .iter()
            .map(|text| PendingBlock {
                title: None,
                text: text.clone(),
            })
            .collect()
    }

    fn merged_texts(chunks: Vec<PageChunk>) -> Vec<String> {
        chunks.into_iter().map(|chunk| chunk.text).collect()
    }

    fn paragraph(number: usize) -> String {
        let sentences = (0..6)
            .map(|offset| SENTENCES[(number + offset * 3) % SENTENCES.len()])
            .collect::<Vec<_>>()
            .join(" ");
        format!("Paragraph {number}. {sentences}")
    }

    /// Four headed sections of five paragraphs each.
    fn regulation_page() -> (Vec<Block>, Vec<String>) {
        let mut blocks = Vec::new();
        let mut paragraphs = Vec::new();
        for (section, heading) in HEADINGS.iter().enumerate() {
            blocks.push(title(heading));
            for offset in 1..=5 {
                let text = paragraph(section * 5 + offset);
                paragraphs.push(text.clone());
                blocks.push(content(text));
            }
        }
        (blocks, paragraphs)
    }

    fn assert_page_chunk_invariants(tokenizer: &dyn Tokenizer) {
        let config = ChunkingConfig::default();
        let (blocks, paragraphs) = regulation_page();
        let chunks = build_page_chunks(&blocks, &config, tokenizer);

        assert!(chunks.len() > 1, "page should need more than one chunk");

        for chunk in &chunks {
            let tokens = tokenizer.count(&chunk.text);
            assert!(tokens <= config.max_chunk_size, "chunk of {tokens} tokens");
            assert!(tokens >= config.min_chunk_size, "chunk of {tokens} tokens");
        }

        for paragraph in &paragraphs {
            assert!(
                chunks.iter().any(|chunk| chunk.text.contains(paragraph.as_str())),
                "lost content: {paragraph}"
            );
        }

        for pair in chunks.windows(2) {
            let overlap = tokenizer.tail(&pair[0].text, config.chunk_overlap);
            let overlap = overlap.trim();
            assert!(!overlap.is_empty());
            assert!(tokenizer.count(overlap) <= config.chunk_overlap);
            assert!(pair[1].text.starts_with(overlap));
        }

        let heading_positions = chunks
            .iter()
            .map(|chunk| {
                let title = chunk.title.as_deref().expect("every chunk follows a heading");
                HEADINGS
                    .iter()
                    .position(|heading| *heading == title)
                    .expect("title is a page heading")
            })
            .collect::<Vec<_>>();
        assert_eq!(heading_positions[0], 0);
        assert!(heading_positions.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn validate_rejects_inconsistent_sizes() {
        assert!(ChunkingConfig::default().validate().is_ok());

        let overlap_too_large = ChunkingConfig {
            chunk_overlap: 1024,
            ..ChunkingConfig::default()
        };
        assert!(overlap_too_large.validate().is_err());

        let target_above_max = ChunkingConfig {
            target_chunk_size: 2048,
            ..ChunkingConfig::default()
        };
        assert!(target_above_max.validate().is_err());

        let min_above_target = ChunkingConfig {
            min_chunk_size: 2000,
            ..ChunkingConfig::default()
        };
        assert!(min_above_target.validate().is_err());

        let zero_target = ChunkingConfig {
            target_chunk_size: 0,
            chunk_overlap: 0,
            min_chunk_size: 0,
            ..ChunkingConfig::default()
        };
        assert!(zero_target.validate().is_err());
    }

    #[test]
    fn blocks_within_target_merge_into_one_chunk() {
        let blocks = vec!["a".repeat(400), "b".repeat(400), "c".repeat(400)];
        let chunks = merge_blocks_into_chunks(
            &untitled(&blocks),
            &ChunkingConfig::default(),
            &CharApproxTokenizer,
        );

        assert_eq!(merged_texts(chunks), vec![blocks.join(" ")]);
    }

    #[test]
    fn merge_split_seeds_next_chunk_with_overlap_tail() {
        let tokenizer = CharApproxTokenizer;
        let blocks = vec!["a".repeat(2800), "b".repeat(1200), "c".repeat(3200)];
        let chunks = merged_texts(merge_blocks_into_chunks(
            &untitled(&blocks),
            &ChunkingConfig::default(),
            &tokenizer,
        ));

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 4001);
        let overlap = tokenizer.tail(&chunks[0], 256);
        assert_eq!(overlap.chars().count(), 1024);
        assert!(chunks[1].starts_with(&overlap));
        assert!(chunks[1].ends_with(&"c".repeat(3200)));
    }

    #[test]
    fn undersized_remainder_joins_previous_chunk_without_overlap_seed() {
        let config = ChunkingConfig {
            chunk_overlap: 64,
            ..ChunkingConfig::default()
        };
        let blocks = vec!["a".repeat(4000), "b".repeat(400)];
        let chunks = merge_blocks_into_chunks(&untitled(&blocks), &config, &CharApproxTokenizer);

        assert_eq!(
            merged_texts(chunks),
            vec![format!("{} {}", "a".repeat(4000), "b".repeat(400))]
        );
    }

    #[test]
    fn undersized_only_chunk_is_still_emitted() {
        let chunks = merge_blocks_into_chunks(
            &untitled(&["short but long enough block".to_string()]),
            &ChunkingConfig::default(),
            &CharApproxTokenizer,
        );
        assert_eq!(
            merged_texts(chunks),
            vec!["short but long enough block".to_string()]
        );
    }

    #[test]
    fn oversized_block_is_split_into_bounded_windows() {
        let tokenizer = CharApproxTokenizer;
        let config = ChunkingConfig::default();
        let chunks = build_page_chunks(&[content("x".repeat(8000))], &config, &tokenizer);

        // 4096-char windows advancing 3072 chars: [0, 4096), [3072, 7168), [6144, 8000)
        assert_eq!(chunks.len(), 3);
        assert!(
            chunks
                .iter()
                .all(|chunk| tokenizer.count(&chunk.text) <= config.max_chunk_size)
        );
        assert_eq!(chunks[2].text.chars().count(), 1856);
    }

    #[test]
    fn short_titled_sections_share_one_chunk() {
        let body = "Development is permitted where the enlargement does not exceed the height \
                    of the existing roof and uses materials of a similar appearance."
            .to_string();
        let chunks = build_page_chunks(
            &[
                title("Class A Rear Extensions"),
                content(body.clone()),
                title("Class B Roof Additions"),
                content(body.clone()),
                title("Class C Roof Alterations"),
                content(body.clone()),
            ],
            &ChunkingConfig::default(),
            &CharApproxTokenizer,
        );

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].title.as_deref(), Some("Class A Rear Extensions"));
        assert_eq!(chunks[0].text, [body.as_str(); 3].join(" "));
    }

    #[test]
    fn chunk_takes_title_of_its_first_new_block() {
        let config = ChunkingConfig {
            target_chunk_size: 16,
            max_chunk_size: 32,
            chunk_overlap: 2,
            min_chunk_size: 4,
            min_block_length: 20,
        };
        let body = |tag: &str| content(format!("{tag} body text that is long enough"));
        let chunks = build_page_chunks(
            &[
                body("intro"),
                title("Section 1 Rear Extensions"),
                body("first"),
                title("Section 2 Side Extensions"),
                body("second"),
                title("Unused heading at page end"),
            ],
            &config,
            &CharApproxTokenizer,
        );

        let titles = chunks
            .iter()
            .map(|chunk| chunk.title.as_deref())
            .collect::<Vec<_>>();
        assert_eq!(titles, vec![None, Some("Section 2 Side Extensions")]);
        assert!(chunks[0].text.starts_with("intro"));
        assert!(chunks[1].text.ends_with("second body text that is long enough"));
    }

    #[test]
    fn headings_below_min_block_length_are_ignored() {
        let chunks = build_page_chunks(
            &[
                title("Schedule 2 General Provisions"),
                title("Part 1"),
                content("Permitted development rights for householders".to_string()),
            ],
            &ChunkingConfig::default(),
            &CharApproxTokenizer,
        );

        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].title.as_deref(),
            Some("Schedule 2 General Provisions")
        );
    }

    #[test]
    fn multi_section_page_keeps_bounds_in_approximate_mode() {
        assert_page_chunk_invariants(&CharApproxTokenizer);
    }

    #[test]
    fn multi_section_page_keeps_bounds_with_cl100k() {
        let tokenizer = BpeTokenizer::cl100k_base().expect("cl100k_base loads");
        assert_page_chunk_invariants(&tokenizer);
    }

    #[test]
    fn short_content_blocks_are_dropped() {
        let chunks = build_page_chunks(
            &[content("ten chars!".to_string())],
            &ChunkingConfig::default(),
            &CharApproxTokenizer,
        );
        assert!(chunks.is_empty());
    }

    #[test]
    fn page_with_only_titles_emits_nothing() {
        let chunks = build_page_chunks(
            &[title("Schedule 2 General Provisions"), title("Part 1")],
            &ChunkingConfig::default(),
            &CharApproxTokenizer,
        );
        assert!(chunks.is_empty());
    }
}
