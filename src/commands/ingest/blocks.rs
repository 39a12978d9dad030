use super::page_source::RawBlock;

const DEFAULT_FONT_SIZE: f32 = 12.0;
const TITLE_FONT_RATIO: f32 = 1.15;
const TITLE_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub text: String,
    pub font_size: f32,
    pub is_title: bool,
}

/// Classifies one page's raw blocks as titles or content.
///
/// A block is a title when its largest span reaches 1.15x the page's average
/// span size, it is shorter than 200 characters and it does not end with a
/// period. This is a heuristic: a short, large, unpunctuated body line is
/// classified as a title too.
pub fn extract_blocks(raw_blocks: &[RawBlock]) -> Vec<Block> {
    let threshold = average_font_size(raw_blocks) * TITLE_FONT_RATIO;

    raw_blocks
        .iter()
        .filter_map(|raw| {
            let text = block_text(raw);
            if text.is_empty() {
                return None;
            }

            let font_size = max_span_size(raw);
            let is_title = font_size >= threshold
                && text.chars().count() < TITLE_MAX_CHARS
                && !text.ends_with('.');

            Some(Block {
                text,
                font_size,
                is_title,
            })
        })
        .collect()
}

fn average_font_size(raw_blocks: &[RawBlock]) -> f32 {
    let sizes = raw_blocks
        .iter()
        .flat_map(|block| block.lines.iter())
        .flat_map(|line| line.spans.iter())
        .map(|span| span.font_size)
        .collect::<Vec<f32>>();

    if sizes.is_empty() {
        return DEFAULT_FONT_SIZE;
    }
    sizes.iter().sum::<f32>() / sizes.len() as f32
}

fn max_span_size(raw: &RawBlock) -> f32 {
    raw.lines
        .iter()
        .flat_map(|line| line.spans.iter())
        .map(|span| span.font_size)
        .fold(0.0, f32::max)
}

fn block_text(raw: &RawBlock) -> String {
    raw.lines
        .iter()
        .map(|line| {
            line.spans
                .iter()
                .map(|span| span.text.as_str())
                .collect::<String>()
        })
        .collect::<Vec<String>>()
        .join(" ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::super::page_source::{RawLine, RawSpan};
    use super::*;

    fn raw(lines: &[&[(&str, f32)]]) -> RawBlock {
        RawBlock {
            lines: lines
                .iter()
                .map(|spans| RawLine {
                    spans: spans
                        .iter()
                        .map(|(text, font_size)| RawSpan {
                            text: (*text).to_string(),
                            font_size: *font_size,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn large_short_unpunctuated_block_is_title() {
        let blocks = extract_blocks(&[
            raw(&[&[("Part 1 Development within the curtilage", 16.0)]]),
            raw(&[
                &[("The enlargement of a dwellinghouse ", 10.0), ("is permitted", 10.0)],
                &[("subject to the limits below.", 10.0)],
            ]),
        ]);

        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].is_title);
        assert_eq!(blocks[0].font_size, 16.0);
        assert!(!blocks[1].is_title);
        assert_eq!(
            blocks[1].text,
            "The enlargement of a dwellinghouse is permitted subject to the limits below."
        );
    }

    #[test]
    fn trailing_period_or_length_disqualifies_title() {
        let long_heading = "Heading ".repeat(30);
        let blocks = extract_blocks(&[
            raw(&[&[("Ends with a period.", 18.0)]]),
            raw(&[&[(long_heading.as_str(), 18.0)]]),
            raw(&[&[("body", 10.0)]]),
            raw(&[&[("body", 10.0)]]),
        ]);

        assert!(!blocks[0].is_title);
        assert!(!blocks[1].is_title);
    }

    #[test]
    fn whitespace_only_blocks_are_dropped() {
        let blocks = extract_blocks(&[
            raw(&[&[("   ", 10.0)], &[("\t", 10.0)]]),
            raw(&[&[("  kept text  ", 10.0)]]),
        ]);

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text, "kept text");
    }

    #[test]
    fn page_without_spans_uses_default_average() {
        assert!(extract_blocks(&[]).is_empty());
        assert_eq!(average_font_size(&[]), DEFAULT_FONT_SIZE);
        assert_eq!(average_font_size(&[RawBlock::default()]), DEFAULT_FONT_SIZE);
    }

    #[test]
    fn uniform_font_page_has_titles_only_when_unpunctuated() {
        // threshold is 1.15x the average, so equal sizes never reach it
        let blocks = extract_blocks(&[
            raw(&[&[("Schedule 2", 11.0)]]),
            raw(&[&[("Some body text without a period", 11.0)]]),
        ]);
        assert!(blocks.iter().all(|block| !block.is_title));
    }

    #[test]
    fn emphasised_body_line_is_misclassified_as_title() {
        // known limitation of the font-size heuristic
        let blocks = extract_blocks(&[
            raw(&[&[("Planning permission is NOT required", 14.0)]]),
            raw(&[&[("regular body text on the page.", 10.0)]]),
            raw(&[&[("more regular body text here.", 10.0)]]),
        ]);

        assert!(blocks[0].is_title);
    }
}
