//! Conversion collaborator invoked by the worker for each request.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// Converts the object behind `object_ref` and returns the produced artifact's ref.
///
/// The worker treats any error as a conversion failure and reports it in the
/// response instead of failing itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, object_ref: &str) -> Result<String>;
}

const FILE_SCHEME: &str = "file://";

/// SVG to PDF converter using svg2pdf for true vector fidelity.
///
/// Object refs are local paths, optionally prefixed with `file://`. The PDF
/// is written as `<stem>.pdf` into the output directory, or next to the
/// source when none is configured.
pub struct SvgToPdfConverter {
    output_dir: Option<PathBuf>,
}

impl SvgToPdfConverter {
    /// Creates a converter that writes next to each source file.
    pub fn new() -> Self {
        Self { output_dir: None }
    }

    pub fn with_output_dir(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: Some(output_dir.into()),
        }
    }

    fn output_path(&self, source: &Path) -> Result<PathBuf> {
        let stem = source
            .file_stem()
            .with_context(|| format!("No file name in {}", source.display()))?;
        let dir = match &self.output_dir {
            Some(dir) => dir.clone(),
            None => source.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        Ok(dir.join(format!("{}.pdf", stem.to_string_lossy())))
    }

    /// Renders SVG content to PDF bytes.
    ///
    /// # Errors
    ///
    /// - SVG parsing errors (malformed XML, unsupported features)
    /// - Invalid dimensions (zero or negative width/height)
    pub fn render(svg_content: &str) -> Result<Vec<u8>> {
        // Parse SVG to usvg tree
        let tree = usvg::Tree::from_str(svg_content, &usvg::Options::default())
            .context("Failed to parse SVG content")?;

        let size = tree.size();
        if size.width() <= 0.0 || size.height() <= 0.0 {
            anyhow::bail!(
                "Invalid SVG dimensions: {}x{}",
                size.width(),
                size.height()
            );
        }

        Ok(svg2pdf::to_pdf(
            &tree,
            svg2pdf::ConversionOptions::default(),
            svg2pdf::PageOptions::default(),
        ))
    }
}

impl Default for SvgToPdfConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Converter for SvgToPdfConverter {
    async fn convert(&self, object_ref: &str) -> Result<String> {
        let (prefixed, path) = match object_ref.strip_prefix(FILE_SCHEME) {
            Some(path) => (true, path),
            None => (false, object_ref),
        };
        let source = PathBuf::from(path);
        let output = self.output_path(&source)?;

        info!("Converting SVG to PDF (VECTOR): source={}", source.display());

        let svg = tokio::fs::read_to_string(&source)
            .await
            .with_context(|| format!("Failed to read {}", source.display()))?;

        let pdf_data = tokio::task::spawn_blocking(move || Self::render(&svg))
            .await
            .context("Conversion task panicked")??;

        tokio::fs::write(&output, &pdf_data)
            .await
            .with_context(|| format!("Failed to write PDF to {}", output.display()))?;

        info!("PDF export complete (VECTOR): {} bytes", pdf_data.len());

        let produced = output.to_string_lossy();
        Ok(if prefixed {
            format!("{FILE_SCHEME}{produced}")
        } else {
            produced.into_owned()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SQUARE: &str = r#"<svg xmlns="http://www.w3.org/2000/svg" width="100" height="100">
        <rect x="10" y="10" width="80" height="80" fill="blue"/>
    </svg>"#;

    fn write_svg(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_convert_writes_pdf_next_to_source() {
        let dir = TempDir::new().unwrap();
        let source = write_svg(&dir, "drawing.svg", SQUARE);

        let produced = SvgToPdfConverter::new()
            .convert(source.to_str().unwrap())
            .await
            .unwrap();

        let expected = dir.path().join("drawing.pdf");
        assert_eq!(produced, expected.to_string_lossy());
        assert!(std::fs::metadata(&expected).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_convert_keeps_file_scheme_and_output_dir() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let source = write_svg(&dir, "sheet.svg", SQUARE);

        let converter = SvgToPdfConverter::with_output_dir(out.path());
        let produced = converter
            .convert(&format!("file://{}", source.display()))
            .await
            .unwrap();

        let expected = out.path().join("sheet.pdf");
        assert_eq!(produced, format!("file://{}", expected.display()));
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn test_invalid_svg() {
        let dir = TempDir::new().unwrap();
        let source = write_svg(&dir, "bad.svg", "not an svg");

        let result = SvgToPdfConverter::new().convert(source.to_str().unwrap()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_dimensions() {
        let svg = r#"<svg xmlns="http://www.w3.org/2000/svg" width="0" height="0"></svg>"#;
        assert!(SvgToPdfConverter::render(svg).is_err());
    }

    #[tokio::test]
    async fn test_missing_source() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.svg");

        let result = SvgToPdfConverter::new().convert(missing.to_str().unwrap()).await;
        assert!(result.is_err());
    }
}
