//! Attachment pipeline: writes uploaded files into the blob tree,
//! probes images, renders thumbnails, and records the metadata row.
//!
//! Blobs live under `<upload_folder>/YYYY/MM/DD/<epoch>-<filename>`, with
//! the thumbnail (if any) next to the original at `<path>.thumbnail`. The
//! database only ever sees the relative path.

use std::fs;
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};

use jiff::Timestamp;
use serde_json::{Map, Value};

use crate::model::Attachment;
use crate::storage::{NewAttachment, Storage, StorageError};

/// Thumbnails are boxed to this many pixels on the longer side.
const THUMBNAIL_SIZE: u32 = 100;

/// Errors from the attachment pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = core::result::Result<T, AttachmentError>;

/// The filesystem interface the pipeline writes through. The core never
/// touches the blob tree directly, so tests and alternative backends can
/// substitute their own.
pub trait Blobs: Send + Sync {
    fn mkdir_all(&self, rel: &Path) -> io::Result<()>;
    fn write_file(&self, rel: &Path, bytes: &[u8]) -> io::Result<()>;
    /// Hard link `from` to `to`, copying when the filesystem refuses.
    fn link(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// Blob storage rooted at a local directory (the `upload_folder`).
pub struct LocalBlobs {
    root: PathBuf,
}

impl LocalBlobs {
    /// Creates the root directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Resolves a relative blob path for serving. Refuses absolute paths
    /// and parent-directory components.
    pub fn resolve(&self, rel: &str) -> Option<PathBuf> {
        let rel = Path::new(rel);
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if safe { Some(self.root.join(rel)) } else { None }
    }
}

impl Blobs for LocalBlobs {
    fn mkdir_all(&self, rel: &Path) -> io::Result<()> {
        fs::create_dir_all(self.root.join(rel))
    }

    fn write_file(&self, rel: &Path, bytes: &[u8]) -> io::Result<()> {
        fs::write(self.root.join(rel), bytes)
    }

    fn link(&self, from: &Path, to: &Path) -> io::Result<()> {
        let from = self.root.join(from);
        let to = self.root.join(to);
        if fs::hard_link(&from, &to).is_err() {
            fs::copy(&from, &to)?;
        }
        Ok(())
    }
}

/// One file received for storage, from a multipart upload or the inline
/// image extractor.
#[derive(Debug)]
pub struct Upload {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Stores an upload in the blob tree and records its attachment row,
/// bound to `entry_id` when already known.
///
/// Recognisable images get their dimensions recorded and a JPEG thumbnail
/// of at most 100×100 (aspect preserved, alpha flattened onto white);
/// images already that small reuse the original as their own thumbnail.
pub fn save_attachment(
    storage: &Storage,
    blobs: &dyn Blobs,
    upload: &Upload,
    timestamp: Timestamp,
    entry_id: Option<i64>,
    extra_metadata: Option<Map<String, Value>>,
    embedded: bool,
) -> Result<Attachment> {
    let today = timestamp.strftime("%Y/%m/%d").to_string();
    let epoch = timestamp.as_second();
    let filename = sanitise_filename(&upload.filename);
    let path = format!("{today}/{epoch}-{filename}");
    let rel = PathBuf::from(&path);

    blobs.mkdir_all(Path::new(&today))?;
    blobs.write_file(&rel, &upload.bytes)?;

    let mut metadata = extra_metadata;
    if let Ok(image) = image::load_from_memory(&upload.bytes) {
        let meta = metadata.get_or_insert_with(Map::new);
        meta.insert(
            "size".into(),
            serde_json::json!({"width": image.width(), "height": image.height()}),
        );
        if image.width() > THUMBNAIL_SIZE || image.height() > THUMBNAIL_SIZE {
            match encode_thumbnail(&image) {
                Ok((bytes, width, height)) => {
                    let thumb_rel = thumbnail_path(&rel);
                    blobs.write_file(&thumb_rel, &bytes)?;
                    meta.insert(
                        "thumbnail_size".into(),
                        serde_json::json!({"width": width, "height": height}),
                    );
                }
                Err(err) => {
                    tracing::warn!(%err, path = %rel.display(), "could not render thumbnail");
                }
            }
        } else {
            // Small image, reuse it as its own thumbnail.
            blobs.link(&rel, &thumbnail_path(&rel))?;
        }
    }

    let content_type = upload
        .content_type
        .clone()
        .or_else(|| guess_content_type(&filename).map(str::to_string));

    let attachment = storage.insert_attachment(NewAttachment {
        entry_id,
        filename: Some(filename),
        timestamp,
        path,
        content_type,
        embedded,
        metadata,
    })?;
    Ok(attachment)
}

fn thumbnail_path(rel: &Path) -> PathBuf {
    let mut s = rel.as_os_str().to_owned();
    s.push(".thumbnail");
    PathBuf::from(s)
}

/// JPEG-encode a bounded thumbnail. JPEG has no alpha channel, so
/// transparent sources are composed onto white first.
fn encode_thumbnail(image: &image::DynamicImage) -> image::ImageResult<(Vec<u8>, u32, u32)> {
    let thumb = image.thumbnail(THUMBNAIL_SIZE, THUMBNAIL_SIZE);
    let rgb = if thumb.color().has_alpha() {
        let rgba = thumb.to_rgba8();
        let mut background = image::RgbaImage::from_pixel(
            rgba.width(),
            rgba.height(),
            image::Rgba([255, 255, 255, 255]),
        );
        image::imageops::overlay(&mut background, &rgba, 0, 0);
        image::DynamicImage::ImageRgba8(background).to_rgb8()
    } else {
        thumb.to_rgb8()
    };
    let mut buf = Cursor::new(Vec::new());
    rgb.write_to(&mut buf, image::ImageFormat::Jpeg)?;
    Ok((buf.into_inner(), rgb.width(), rgb.height()))
}

/// Strip any path part from an uploaded filename.
fn sanitise_filename(raw: &str) -> String {
    let base = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(raw)
        .trim();
    if base.is_empty() {
        "file".to_string()
    } else {
        base.to_string()
    }
}

/// Best-effort content type from the file extension, for uploads that
/// arrive without one.
pub(crate) fn guess_content_type(filename: &str) -> Option<&'static str> {
    let ext = filename.rsplit('.').next()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "csv" => "text/csv",
        "zip" => "application/zip",
        _ => return None,
    })
}
