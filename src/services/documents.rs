use std::path::{Component, Path, PathBuf};

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use rand_core::{OsRng, RngCore};
use uuid::Uuid;

pub const ALLOWED_MIME_TYPES: [&str; 4] = ["application/pdf", "image/jpeg", "image/png", "image/jpg"];

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("No file provided")]
    MissingFile,
    #[error("Invalid file type. Only PDF, JPG, and PNG are allowed.")]
    UnsupportedType,
    #[error("File size exceeds {0}MB limit")]
    TooLarge(usize),
    #[error("invalid storage path: {0}")]
    InvalidPath(String),
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn validate_upload(mime_type: &str, size: usize, max_bytes: usize) -> Result<(), UploadError> {
    if !ALLOWED_MIME_TYPES.contains(&mime_type) {
        return Err(UploadError::UnsupportedType);
    }
    if size > max_bytes {
        return Err(UploadError::TooLarge(max_bytes / (1024 * 1024)));
    }
    Ok(())
}

/// Local file storage for uploaded documents, served back under
/// `public_base_url`.
#[derive(Clone, Debug)]
pub struct DocumentStorage {
    root: PathBuf,
    public_base_url: String,
}

impl DocumentStorage {
    pub fn new(root: PathBuf, public_base_url: String) -> Self {
        Self {
            root,
            public_base_url,
        }
    }

    #[cfg(test)]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `bytes` under a fresh name in the agency's directory and returns
    /// the relative storage path.
    pub async fn save(
        &self,
        agency_id: Uuid,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<String, UploadError> {
        let relative = storage_path(agency_id, mime_type);
        let target = self.resolve(&relative)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        Ok(relative)
    }

    pub async fn remove(&self, relative: &str) -> Result<(), UploadError> {
        let target = self.resolve(relative)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    pub fn public_url(&self, relative: &str) -> String {
        format!("{}/{}", self.public_base_url, relative)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, UploadError> {
        let path = Path::new(relative);
        let plain = path.components().count() > 0
            && path
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !plain {
            return Err(UploadError::InvalidPath(relative.to_string()));
        }
        Ok(self.root.join(path))
    }
}

/// `<agency_id>/<unix millis>-<random>.<ext>`. The client's file name never
/// reaches the disk; the extension follows the accepted mime type.
pub fn storage_path(agency_id: Uuid, mime_type: &str) -> String {
    let mut random = [0u8; 6];
    OsRng.fill_bytes(&mut random);
    format!(
        "{agency_id}/{}-{}.{}",
        Utc::now().timestamp_millis(),
        Base64UrlUnpadded::encode_string(&random),
        file_extension(mime_type)
    )
}

fn file_extension(mime_type: &str) -> &'static str {
    match mime_type {
        "application/pdf" => "pdf",
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 10 * 1024 * 1024;

    fn temp_storage() -> DocumentStorage {
        let root = std::env::temp_dir().join(format!("agencyhub-docs-{}", Uuid::new_v4()));
        DocumentStorage::new(root, "/files".into())
    }

    #[test]
    fn uploads_are_limited_by_type_and_size() {
        assert!(validate_upload("application/pdf", 1024, MAX).is_ok());
        assert!(validate_upload("image/jpg", MAX, MAX).is_ok());
        assert!(matches!(
            validate_upload("text/plain", 10, MAX),
            Err(UploadError::UnsupportedType)
        ));
        let too_large = validate_upload("image/png", MAX + 1, MAX).unwrap_err();
        assert_eq!(too_large.to_string(), "File size exceeds 10MB limit");
    }

    #[test]
    fn storage_paths_are_scoped_to_the_agency() {
        let agency_id = Uuid::new_v4();
        let path = storage_path(agency_id, "application/pdf");
        let (dir, name) = path.split_once('/').unwrap();

        assert_eq!(dir, agency_id.to_string());
        assert!(name.ends_with(".pdf"));
        let (millis, _) = name.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_ne!(path, storage_path(agency_id, "application/pdf"));
    }

    #[test]
    fn extension_follows_the_mime_type() {
        assert_eq!(file_extension("image/jpeg"), "jpg");
        assert_eq!(file_extension("image/jpg"), "jpg");
        assert_eq!(file_extension("application/pdf"), "pdf");
        assert_eq!(file_extension("image/png"), "png");
        assert_eq!(file_extension("text/html"), "bin");
    }

    #[tokio::test]
    async fn saved_files_ignore_the_uploaded_name() {
        let storage = temp_storage();
        let relative = storage
            .save(Uuid::nil(), "application/pdf", b"<script>alert(1)</script>")
            .await
            .unwrap();

        assert!(relative.ends_with(".pdf"));
        assert!(!relative.contains("html"));

        let _ = tokio::fs::remove_dir_all(storage.root()).await;
    }

    #[tokio::test]
    async fn save_then_remove_round_trips_on_disk() {
        let storage = temp_storage();
        let agency_id = Uuid::new_v4();

        let relative = storage
            .save(agency_id, "image/png", b"png-bytes")
            .await
            .unwrap();
        let on_disk = storage.root().join(&relative);
        assert_eq!(tokio::fs::read(&on_disk).await.unwrap(), b"png-bytes");
        assert_eq!(storage.public_url(&relative), format!("/files/{relative}"));

        storage.remove(&relative).await.unwrap();
        assert!(!on_disk.exists());
        // already gone
        storage.remove(&relative).await.unwrap();

        let _ = tokio::fs::remove_dir_all(storage.root()).await;
    }

    #[tokio::test]
    async fn paths_outside_the_root_are_rejected() {
        let storage = temp_storage();
        assert!(matches!(
            storage.remove("../etc/passwd").await,
            Err(UploadError::InvalidPath(_))
        ));
        assert!(matches!(
            storage.remove("/etc/passwd").await,
            Err(UploadError::InvalidPath(_))
        ));
    }
}
