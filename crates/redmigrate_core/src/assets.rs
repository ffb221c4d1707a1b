use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::assembla::AssemblaApi;

/// A downloaded attachment ready for re-upload. `filename` is what the
/// target platform sees and what converted text references; `local_path` is
/// where the bytes live until the caller deletes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAsset {
    pub local_path: PathBuf,
    pub filename: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no response from document download after retries")]
    NoResponse,
    #[error("document download failed with HTTP {0}")]
    Status(u16),
    #[error("failed to write asset file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to rasterize vector asset: {0}")]
    Rasterize(String),
}

/// Local directory that resolved images are written into.
#[derive(Debug, Clone)]
pub struct AssetStore {
    dir: PathBuf,
}

impl AssetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create asset directory {}", self.dir.display()))
    }

    /// Download one document and settle it into the store under the
    /// deterministic name `{space_id}_{document_id}.{ext}`.
    ///
    /// The true format is sniffed from the bytes, never from headers or the
    /// reference itself: a recognized raster signature keeps the file as-is
    /// with the detected extension appended; anything else is assumed to be
    /// SVG and rasterized to a PNG that supersedes the original payload.
    /// Resolving the same reference again always yields the same filename.
    pub fn resolve<A: AssemblaApi + ?Sized>(
        &self,
        api: &mut A,
        space_id: &str,
        document_id: &str,
    ) -> Result<ResolvedAsset, ResolveError> {
        let payload = api
            .download_document(space_id, document_id)
            .ok_or(ResolveError::NoResponse)?;
        if !payload.is_success() {
            return Err(ResolveError::Status(payload.status));
        }

        let stem = format!("{space_id}_{document_id}");
        let raw_path = self.dir.join(&stem);
        fs::write(&raw_path, &payload.bytes)?;

        match image::guess_format(&payload.bytes) {
            Ok(format) => {
                let ext = format.extensions_str().first().copied().unwrap_or("bin");
                let filename = format!("{stem}.{ext}");
                let final_path = self.dir.join(&filename);
                fs::rename(&raw_path, &final_path)?;
                Ok(ResolvedAsset {
                    local_path: final_path,
                    filename,
                })
            }
            Err(_) => {
                let filename = format!("{stem}.png");
                let final_path = self.dir.join(&filename);
                rasterize_svg(&payload.bytes, &final_path)?;
                Ok(ResolvedAsset {
                    local_path: final_path,
                    filename,
                })
            }
        }
    }
}

fn rasterize_svg(bytes: &[u8], output: &Path) -> Result<(), ResolveError> {
    use resvg::{tiny_skia, usvg};

    let tree = usvg::Tree::from_data(bytes, &usvg::Options::default())
        .map_err(|error| ResolveError::Rasterize(error.to_string()))?;
    let size = tree.size().to_int_size();
    let mut pixmap = tiny_skia::Pixmap::new(size.width(), size.height())
        .ok_or_else(|| ResolveError::Rasterize("zero-sized vector image".to_string()))?;
    resvg::render(&tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());
    pixmap
        .save_png(output)
        .map_err(|error| ResolveError::Rasterize(error.to_string()))?;
    Ok(())
}
