use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub struct RawSpan {
    pub text: String,
    pub font_size: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawLine {
    pub spans: Vec<RawSpan>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBlock {
    pub lines: Vec<RawLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// 0-based position in the page's image list.
    pub index: usize,
    pub locator: String,
}

/// One opened PDF, page by page.
pub trait PageSource {
    fn page_count(&self) -> usize;
    fn text_blocks(&self, page_index: usize) -> Result<Vec<RawBlock>>;
    fn images(&self, page_index: usize) -> Result<Vec<ImageRef>>;
    fn image_bytes(&self, image: &ImageRef) -> Result<Vec<u8>>;
}

pub trait DocumentOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn PageSource>>;
}

/// Opens PDFs through the poppler command-line tools: `pdftohtml -xml` for
/// positioned text with font sizes, `pdfimages` for embedded rasters.
#[derive(Debug, Clone, Default)]
pub struct PopplerOpener {
    pub max_pages: Option<usize>,
}

impl DocumentOpener for PopplerOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn PageSource>> {
        if !path.exists() {
            bail!("PDF file not found: {}", path.display());
        }

        let xml = run_pdftohtml_xml(path, self.max_pages)?;
        let pages = parse_pdftohtml_xml(&xml)?;

        Ok(Box::new(PopplerDocument {
            pdf_path: path.to_path_buf(),
            pages,
            scratch_dir: scratch_dir_for(path),
        }))
    }
}

struct PopplerDocument {
    pdf_path: PathBuf,
    pages: Vec<Vec<RawBlock>>,
    scratch_dir: PathBuf,
}

impl PageSource for PopplerDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn text_blocks(&self, page_index: usize) -> Result<Vec<RawBlock>> {
        self.pages.get(page_index).cloned().with_context(|| {
            format!(
                "page {} is out of range for {}",
                page_index + 1,
                self.pdf_path.display()
            )
        })
    }

    fn images(&self, page_index: usize) -> Result<Vec<ImageRef>> {
        let page_number = page_index + 1;
        fs::create_dir_all(&self.scratch_dir).with_context(|| {
            format!(
                "failed to create image scratch directory {}",
                self.scratch_dir.display()
            )
        })?;

        // Soft masks and stencils are written as files too but are not images.
        let listing = run_pdfimages(&self.pdf_path, page_number, |command| {
            command.arg("-list").arg(&self.pdf_path);
        })?;
        let kept = parse_pdfimages_list(&listing);

        let prefix_name = format!("page-{page_number:04}");
        run_pdfimages(&self.pdf_path, page_number, |command| {
            command
                .arg("-png")
                .arg(&self.pdf_path)
                .arg(self.scratch_dir.join(&prefix_name));
        })?;

        let file_prefix = format!("{prefix_name}-");
        let mut numbered = fs::read_dir(&self.scratch_dir)
            .with_context(|| format!("failed to read {}", self.scratch_dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;
                let number = image_file_number(name, &file_prefix)?;
                Some((number, path))
            })
            .collect::<Vec<(usize, PathBuf)>>();
        numbered.sort();

        let mut images = Vec::<ImageRef>::new();
        for (number, path) in numbered {
            if kept.contains(&number) {
                images.push(ImageRef {
                    index: images.len(),
                    locator: path.display().to_string(),
                });
            } else {
                let _ = fs::remove_file(&path);
            }
        }
        Ok(images)
    }

    fn image_bytes(&self, image: &ImageRef) -> Result<Vec<u8>> {
        let bytes = fs::read(&image.locator)
            .with_context(|| format!("failed to read extracted image {}", image.locator))?;
        let _ = fs::remove_file(&image.locator);
        Ok(bytes)
    }
}

impl Drop for PopplerDocument {
    fn drop(&mut self) {
        if self.scratch_dir.exists() {
            let _ = fs::remove_dir_all(&self.scratch_dir);
        }
    }
}

fn run_pdfimages(
    pdf_path: &Path,
    page_number: usize,
    configure: impl FnOnce(&mut Command),
) -> Result<String> {
    let mut command = Command::new("pdfimages");
    command
        .arg("-f")
        .arg(page_number.to_string())
        .arg("-l")
        .arg(page_number.to_string());
    configure(&mut command);

    let output = command
        .output()
        .with_context(|| format!("failed to execute pdfimages for {}", pdf_path.display()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "pdfimages returned non-zero exit status for {} page {}: {}",
            pdf_path.display(),
            page_number,
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Image numbers from `pdfimages -list` whose type is `image`.
fn parse_pdfimages_list(listing: &str) -> Vec<usize> {
    listing
        .lines()
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let _page = columns.next()?.parse::<usize>().ok()?;
            let number = columns.next()?.parse::<usize>().ok()?;
            (columns.next()? == "image").then_some(number)
        })
        .collect()
}

/// Number in an extracted file name such as `page-0003-012.png`.
fn image_file_number(file_name: &str, file_prefix: &str) -> Option<usize> {
    let rest = file_name.strip_prefix(file_prefix)?;
    let digits = rest.split('.').next()?;
    digits.parse().ok()
}

fn scratch_dir_for(pdf_path: &Path) -> PathBuf {
    let pdf_stem = pdf_path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("pdf");
    let safe_stem = pdf_stem
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() {
                character
            } else {
                '_'
            }
        })
        .collect::<String>();

    let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    std::env::temp_dir().join(format!(
        "regdocs_images_{}_{}_{}",
        safe_stem,
        std::process::id(),
        stamp
    ))
}

fn run_pdftohtml_xml(pdf_path: &Path, max_pages: Option<usize>) -> Result<String> {
    let mut command = Command::new("pdftohtml");
    command
        .arg("-xml")
        .arg("-i")
        .arg("-q")
        .arg("-enc")
        .arg("UTF-8")
        .arg("-f")
        .arg("1");
    if let Some(max_pages) = max_pages {
        command.arg("-l").arg(max_pages.to_string());
    }
    command.arg("-stdout").arg(pdf_path);

    let output = command
        .output()
        .with_context(|| format!("failed to execute pdftohtml for {}", pdf_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "pdftohtml returned non-zero exit status for {}: {}",
            pdf_path.display(),
            stderr.trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).replace('\u{0000}', ""))
}

#[derive(Debug, Clone)]
struct TextFragment {
    top: f32,
    height: f32,
    font_size: f32,
    text: String,
}

/// Splits `pdftohtml -xml` output into per-page block lists. Font ids are
/// declared once per document, so sizes are resolved against every
/// `fontspec` seen in the file.
pub(crate) fn parse_pdftohtml_xml(xml: &str) -> Result<Vec<Vec<RawBlock>>> {
    let page_regex = Regex::new(r#"(?s)<page\s+number="(\d+)"[^>]*>(.*?)</page>"#)
        .context("failed to compile page regex")?;
    let fontspec_regex = Regex::new(r#"<fontspec\s+id="(\d+)"\s+size="(-?[0-9.]+)""#)
        .context("failed to compile fontspec regex")?;
    let text_regex = Regex::new(
        r#"(?s)<text\s+top="(-?[0-9.]+)"\s+left="-?[0-9.]+"\s+width="-?[0-9.]+"\s+height="(-?[0-9.]+)"\s+font="(\d+)"[^>]*>(.*?)</text>"#,
    )
    .context("failed to compile text regex")?;
    let tag_regex = Regex::new(r"<[^>]+>").context("failed to compile tag regex")?;

    let font_sizes = fontspec_regex
        .captures_iter(xml)
        .filter_map(|captures| {
            let id = captures.get(1)?.as_str().to_string();
            let size = captures.get(2)?.as_str().parse::<f32>().ok()?;
            Some((id, size))
        })
        .collect::<HashMap<String, f32>>();

    let mut pages = Vec::<Vec<RawBlock>>::new();
    for page_captures in page_regex.captures_iter(xml) {
        let page_number = page_captures
            .get(1)
            .and_then(|value| value.as_str().parse::<usize>().ok())
            .unwrap_or(pages.len() + 1)
            .max(1);
        let body = page_captures.get(2).map(|value| value.as_str()).unwrap_or("");

        let fragments = text_regex
            .captures_iter(body)
            .filter_map(|captures| {
                let top = captures.get(1)?.as_str().parse::<f32>().ok()?;
                let height = captures.get(2)?.as_str().parse::<f32>().ok()?;
                let font_size = font_sizes
                    .get(captures.get(3)?.as_str())
                    .copied()
                    .unwrap_or(height);
                let raw_text = captures.get(4)?.as_str();
                let text = decode_xml_entities(&tag_regex.replace_all(raw_text, ""));
                Some(TextFragment {
                    top,
                    height,
                    font_size,
                    text,
                })
            })
            .collect::<Vec<TextFragment>>();

        if pages.len() < page_number {
            pages.resize(page_number, Vec::new());
        }
        pages[page_number - 1] = group_fragments_into_blocks(&fragments);
    }

    Ok(pages)
}

fn decode_xml_entities(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&#160;", " ")
        .replace("&amp;", "&")
        .replace('\u{00a0}', " ")
}

const SAME_LINE_TOLERANCE: f32 = 2.0;
const PARAGRAPH_GAP_RATIO: f32 = 0.6;
const FONT_CHANGE_TOLERANCE: f32 = 1.0;

fn group_fragments_into_blocks(fragments: &[TextFragment]) -> Vec<RawBlock> {
    let mut blocks = Vec::<RawBlock>::new();
    let mut previous: Option<&TextFragment> = None;

    for fragment in fragments {
        if fragment.text.trim().is_empty() {
            continue;
        }

        let placement = match previous {
            Some(prev) if (fragment.top - prev.top).abs() <= SAME_LINE_TOLERANCE => {
                Placement::SameLine
            }
            Some(prev) if continues_block(prev, fragment) => Placement::NextLine,
            _ => Placement::NewBlock,
        };

        match (placement, blocks.last_mut()) {
            (Placement::SameLine, Some(block)) => {
                if let Some(line) = block.lines.last_mut() {
                    let needs_space = line
                        .spans
                        .last()
                        .map(|span| !span.text.ends_with(char::is_whitespace))
                        .unwrap_or(false)
                        && !fragment.text.starts_with(char::is_whitespace);
                    let text = if needs_space {
                        format!(" {}", fragment.text)
                    } else {
                        fragment.text.clone()
                    };
                    line.spans.push(RawSpan {
                        text,
                        font_size: fragment.font_size,
                    });
                }
            }
            (Placement::NextLine, Some(block)) => block.lines.push(RawLine {
                spans: vec![span_of(fragment)],
            }),
            _ => blocks.push(RawBlock {
                lines: vec![RawLine {
                    spans: vec![span_of(fragment)],
                }],
            }),
        }

        previous = Some(fragment);
    }

    blocks
}

#[derive(Copy, Clone)]
enum Placement {
    SameLine,
    NextLine,
    NewBlock,
}

fn span_of(fragment: &TextFragment) -> RawSpan {
    RawSpan {
        text: fragment.text.clone(),
        font_size: fragment.font_size,
    }
}

fn continues_block(previous: &TextFragment, next: &TextFragment) -> bool {
    let gap = next.top - (previous.top + previous.height);
    gap >= -SAME_LINE_TOLERANCE
        && gap <= previous.height * PARAGRAPH_GAP_RATIO
        && (next.font_size - previous.font_size).abs() < FONT_CHANGE_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_texts(blocks: &[RawBlock]) -> Vec<String> {
        blocks
            .iter()
            .map(|block| {
                block
                    .lines
                    .iter()
                    .map(|line| {
                        line.spans
                            .iter()
                            .map(|span| span.text.as_str())
                            .collect::<String>()
                    })
                    .collect::<Vec<_>>()
                    .join("|")
            })
            .collect()
    }

    const SAMPLE_XML: &str = r##"<?xml version="1.0" encoding="UTF-8"?>
<pdf2xml producer="poppler" version="23.02.0">
<page number="1" position="absolute" top="0" left="0" height="1263" width="892">
	<fontspec id="0" size="18" family="Arial" color="#000000"/>
	<fontspec id="1" size="11" family="Arial" color="#000000"/>
<text top="100" left="80" width="400" height="21" font="0"><b>Class A &amp; Rear Extensions</b></text>
<text top="140" left="80" width="600" height="13" font="1">Development is permitted by</text>
<text top="140" left="300" width="100" height="13" font="1">Class A</text>
<text top="155" left="80" width="600" height="13" font="1">where the height does not exceed 4 metres.</text>
<text top="200" left="80" width="600" height="13" font="1">A separate paragraph follows here.</text>
</page>
<page number="2" position="absolute" top="0" left="0" height="1263" width="892">
<text top="90" left="80" width="600" height="13" font="1">Second page &lt;body&gt; text.</text>
</page>
</pdf2xml>
"##;

    #[test]
    fn parse_pdftohtml_xml_groups_lines_into_blocks_per_page() {
        let pages = parse_pdftohtml_xml(SAMPLE_XML).expect("parse");
        assert_eq!(pages.len(), 2);

        assert_eq!(
            block_texts(&pages[0]),
            vec![
                "Class A & Rear Extensions".to_string(),
                "Development is permitted by Class A|where the height does not exceed 4 metres."
                    .to_string(),
                "A separate paragraph follows here.".to_string(),
            ]
        );
        assert_eq!(pages[0][0].lines[0].spans[0].font_size, 18.0);
        assert_eq!(pages[0][1].lines[0].spans[1].font_size, 11.0);

        assert_eq!(block_texts(&pages[1]), vec!["Second page <body> text.".to_string()]);
    }

    #[test]
    fn parse_pdftohtml_xml_keeps_empty_pages_in_position() {
        let xml = r##"<pdf2xml>
<page number="1" position="absolute" top="0" left="0" height="10" width="10">
</page>
<page number="2" position="absolute" top="0" left="0" height="10" width="10">
<fontspec id="0" size="10" family="Times" color="#000000"/>
<text top="10" left="10" width="50" height="12" font="0">Only text</text>
</page>
</pdf2xml>"##;

        let pages = parse_pdftohtml_xml(xml).expect("parse");
        assert_eq!(pages.len(), 2);
        assert!(pages[0].is_empty());
        assert_eq!(block_texts(&pages[1]), vec!["Only text".to_string()]);
    }

    #[test]
    fn column_jump_starts_a_new_block() {
        let fragments = vec![
            TextFragment {
                top: 500.0,
                height: 12.0,
                font_size: 10.0,
                text: "bottom of the left column".to_string(),
            },
            TextFragment {
                top: 100.0,
                height: 12.0,
                font_size: 10.0,
                text: "top of the right column".to_string(),
            },
        ];

        assert_eq!(group_fragments_into_blocks(&fragments).len(), 2);
    }

    #[test]
    fn pdfimages_listing_keeps_only_image_rows() {
        let listing = "\
page   num  type   width height color comp bpc  enc interp  object ID x-ppi y-ppi size ratio
--------------------------------------------------------------------------------------------
   3     0 image    1200   800  rgb     3   8  jpeg   no        41  0   150   150  112K 4.0%
   3     1 smask    1200   800  gray    1   8  image  no        42  0   150   150 9182B 1.0%
   3     2 stencil    64    64  -       1   1  image  no        43  0    72    72   12B 0.3%
   3     3 image     640   480  gray    1   8  image  no        44  0    96    96 20.1K 6.7%
";
        assert_eq!(parse_pdfimages_list(listing), vec![0, 3]);
        assert!(parse_pdfimages_list("").is_empty());
    }

    #[test]
    fn image_file_number_reads_suffix_after_prefix() {
        assert_eq!(image_file_number("page-0003-012.png", "page-0003-"), Some(12));
        assert_eq!(image_file_number("page-0003-000.pbm", "page-0003-"), Some(0));
        assert_eq!(image_file_number("page-0004-001.png", "page-0003-"), None);
        assert_eq!(image_file_number("page-0003-notes.txt", "page-0003-"), None);
    }

    #[test]
    fn poppler_opener_reports_missing_file() {
        let opener = PopplerOpener::default();
        let err = match opener.open(Path::new("/definitely/not/here.pdf")) {
            Ok(_) => panic!("missing file should not open"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("not found"));
    }
}
