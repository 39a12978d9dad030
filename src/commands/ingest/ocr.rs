use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result, bail};
use tracing::warn;

use super::page_source::PageSource;

pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &'static str;
    fn recognize(&self, image_bytes: &[u8], language_hint: &str) -> Result<String>;
}

/// Runs `tesseract stdin stdout -l <lang>` once per image.
#[derive(Debug, Clone, Default)]
pub struct TesseractOcr;

impl OcrEngine for TesseractOcr {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    fn recognize(&self, image_bytes: &[u8], language_hint: &str) -> Result<String> {
        let mut child = Command::new("tesseract")
            .arg("stdin")
            .arg("stdout")
            .arg("-l")
            .arg(language_hint)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to execute tesseract")?;

        let mut stdin = child
            .stdin
            .take()
            .context("failed to open tesseract stdin")?;
        let payload = image_bytes.to_vec();
        // tesseract may start writing before it has read all input
        let writer = thread::spawn(move || stdin.write_all(&payload));

        let output = child
            .wait_with_output()
            .context("failed to wait for tesseract")?;
        match writer.join() {
            Ok(result) => result.context("failed to write image to tesseract")?,
            Err(_) => bail!("tesseract stdin writer panicked"),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "tesseract returned non-zero exit status: {}",
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Tiff,
    Pnm,
    Bmp,
    Gif,
    Jpeg2000,
}

/// Recognizes the raster encodings OCR can read from their magic bytes.
pub fn sniff_image_format(bytes: &[u8]) -> Option<ImageFormat> {
    const JP2_SIGNATURE: &[u8] = &[
        0x00, 0x00, 0x00, 0x0c, 0x6a, 0x50, 0x20, 0x20, 0x0d, 0x0a, 0x87, 0x0a,
    ];

    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]) {
        Some(ImageFormat::Png)
    } else if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        Some(ImageFormat::Jpeg)
    } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
        Some(ImageFormat::Tiff)
    } else if bytes.starts_with(b"BM") {
        Some(ImageFormat::Bmp)
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some(ImageFormat::Gif)
    } else if bytes.starts_with(JP2_SIGNATURE) || bytes.starts_with(&[0xff, 0x4f, 0xff, 0x51]) {
        Some(ImageFormat::Jpeg2000)
    } else if bytes.len() >= 2 && bytes[0] == b'P' && (b'1'..=b'6').contains(&bytes[1]) {
        Some(ImageFormat::Pnm)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageText {
    /// 1-based position in the page's image list.
    pub image_number: usize,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageImageOutcome {
    pub texts: Vec<ImageText>,
    pub failures: usize,
}

/// Recognizes every image on one page independently. Images that cannot be
/// read, decoded or recognized are counted and skipped.
pub fn extract_image_texts(
    source: &dyn PageSource,
    page_index: usize,
    ocr: &dyn OcrEngine,
    language_hint: &str,
) -> PageImageOutcome {
    let mut outcome = PageImageOutcome::default();

    let images = match source.images(page_index) {
        Ok(images) => images,
        Err(err) => {
            warn!(
                page = page_index + 1,
                error = %err,
                "failed to list page images"
            );
            outcome.failures += 1;
            return outcome;
        }
    };

    for image in images {
        let image_number = image.index + 1;
        let recognized = source.image_bytes(&image).and_then(|bytes| {
            if sniff_image_format(&bytes).is_none() {
                bail!("unrecognized image encoding ({} bytes)", bytes.len());
            }
            ocr.recognize(&bytes, language_hint)
        });

        match recognized {
            Ok(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    outcome.texts.push(ImageText {
                        image_number,
                        text: text.to_string(),
                    });
                }
            }
            Err(err) => {
                warn!(
                    page = page_index + 1,
                    image = image_number,
                    engine = ocr.name(),
                    error = %err,
                    "image OCR failed"
                );
                outcome.failures += 1;
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_image_format_recognizes_common_rasters() {
        assert_eq!(
            sniff_image_format(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0]),
            Some(ImageFormat::Png)
        );
        assert_eq!(
            sniff_image_format(&[0xff, 0xd8, 0xff, 0xe0]),
            Some(ImageFormat::Jpeg)
        );
        assert_eq!(sniff_image_format(b"II*\0rest"), Some(ImageFormat::Tiff));
        assert_eq!(sniff_image_format(b"P6\n10 10\n255\n"), Some(ImageFormat::Pnm));
        assert_eq!(sniff_image_format(b"GIF89a...."), Some(ImageFormat::Gif));
        assert_eq!(
            sniff_image_format(&[0xff, 0x4f, 0xff, 0x51, 0x00]),
            Some(ImageFormat::Jpeg2000)
        );
        assert_eq!(sniff_image_format(b"%PDF-1.7"), None);
        assert_eq!(sniff_image_format(b""), None);
    }
}
