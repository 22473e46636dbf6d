#![forbid(unsafe_code)]

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use pr_telemetry_domain::{hash_bytes, is_sha256_hex, BlobRef};
use pr_telemetry_store_core::{BlobNamespace, BlobStore, StoreError};
use ulid::Ulid;

const FILE_URI_PREFIX: &str = "file://";

/// Content-addressed blobs under `<root>/<namespace>/<sha[0..2]>/<sha>`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create the root directory if needed and anchor the store there.
    ///
    /// # Errors
    /// Returns an error if the root cannot be created or resolved.
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create blob root {}", root.display()))?;
        let root = fs::canonicalize(root)
            .with_context(|| format!("failed to resolve blob root {}", root.display()))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, namespace: BlobNamespace, sha256: &str) -> PathBuf {
        self.root
            .join(namespace.as_str())
            .join(&sha256[..2])
            .join(sha256)
    }

    fn path_from_uri(&self, uri: &str) -> Result<PathBuf, StoreError> {
        let raw = uri
            .strip_prefix(FILE_URI_PREFIX)
            .ok_or_else(|| StoreError::Corrupt(format!("unsupported blob uri: {uri}")))?;
        let path = PathBuf::from(raw);
        if !path.starts_with(&self.root) {
            return Err(StoreError::Corrupt(format!(
                "blob uri {uri} lies outside {}",
                self.root.display()
            )));
        }
        Ok(path)
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, namespace: BlobNamespace, bytes: &[u8]) -> Result<BlobRef, StoreError> {
        let sha256 = hash_bytes(bytes);
        let path = self.blob_path(namespace, &sha256);
        let blob = BlobRef {
            uri: format!("{FILE_URI_PREFIX}{}", path.display()),
            sha256,
            size_bytes: u64::try_from(bytes.len()).unwrap_or(u64::MAX),
        };

        if path.exists() {
            tracing::debug!(uri = %blob.uri, "blob already stored");
            return Ok(blob);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        // Unique temp name so concurrent writers of the same content never share a file.
        let tmp_path = path.with_extension(format!("{}.tmp", Ulid::new()));
        fs::write(&tmp_path, bytes).map_err(io_error)?;
        if let Err(err) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(io_error(err));
        }
        Ok(blob)
    }

    fn get(&self, blob: &BlobRef) -> Result<Vec<u8>, StoreError> {
        if !is_sha256_hex(&blob.sha256) {
            return Err(StoreError::Corrupt(format!(
                "invalid blob digest: {}",
                blob.sha256
            )));
        }
        let path = self.path_from_uri(&blob.uri)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::Corrupt(format!("blob missing: {}", blob.uri)));
            }
            Err(err) => return Err(io_error(err)),
        };

        let actual = hash_bytes(&bytes);
        if actual != blob.sha256 {
            return Err(StoreError::Corrupt(format!(
                "blob {} digest mismatch: expected {}, found {actual}",
                blob.uri, blob.sha256
            )));
        }
        Ok(bytes)
    }
}

fn io_error(err: std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("blob io failure: {err}"))
}
