use crate::error::MediaRejection;
use tracing::debug;

/// Extensions accepted for upload. Matching is case-sensitive: `.JPG` is
/// listed on purpose, other casings such as `.Png` or `.JPEG` are not.
pub const ALLOWED_EXTENSIONS: [&str; 4] = [".png", ".jpg", ".JPG", ".jpeg"];

/// Filename gate run before any upload bytes are read
#[derive(Debug, Clone, Default)]
pub struct UploadValidator;

impl UploadValidator {
    pub fn new() -> Self {
        Self
    }

    /// Accept `filename` only if its extension is in [`ALLOWED_EXTENSIONS`]
    pub fn check(&self, filename: &str) -> Result<(), MediaRejection> {
        let ext = extension(filename);

        if ALLOWED_EXTENSIONS.contains(&ext) {
            return Ok(());
        }

        debug!(filename = %filename, extension = %ext, "Rejecting upload extension");

        Err(MediaRejection::Extension {
            filename: filename.to_string(),
        })
    }
}

/// Extension of the last path component including the dot, or `""`.
///
/// A leading dot does not start an extension, so `.png` has none.
pub fn extension(filename: &str) -> &str {
    let base = filename.rsplit('/').next().unwrap_or(filename);

    match base.rfind('.') {
        Some(0) | None => "",
        Some(idx) => &base[idx..],
    }
}
