//! Raw upload bytes, kept until the document is deleted or superseded.
//!
//! Ingestion reads the bytes back from here, which is what lets a failed
//! document be re-ingested without the client uploading it again.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use audit_intel_core::{Error, Result};

pub enum UploadStore {
    Memory(Mutex<HashMap<String, Vec<u8>>>),
    /// One `<document id>.bin` file per upload under the directory.
    Disk(PathBuf),
}

impl UploadStore {
    pub fn memory() -> Self {
        UploadStore::Memory(Mutex::new(HashMap::new()))
    }

    pub fn disk(dir: impl Into<PathBuf>) -> Self {
        UploadStore::Disk(dir.into())
    }

    fn file(dir: &std::path::Path, document_id: &str) -> PathBuf {
        dir.join(format!("{document_id}.bin"))
    }

    pub async fn put(&self, document_id: &str, bytes: &[u8]) -> Result<()> {
        match self {
            UploadStore::Memory(map) => {
                map.lock()
                    .unwrap()
                    .insert(document_id.to_string(), bytes.to_vec());
                Ok(())
            }
            UploadStore::Disk(dir) => {
                tokio::fs::create_dir_all(dir).await.map_err(io)?;
                tokio::fs::write(Self::file(dir, document_id), bytes)
                    .await
                    .map_err(io)
            }
        }
    }

    pub async fn get(&self, document_id: &str) -> Result<Vec<u8>> {
        let missing = || Error::NotFound(format!("upload bytes for document {document_id}"));
        match self {
            UploadStore::Memory(map) => map.lock().unwrap().get(document_id).cloned().ok_or_else(missing),
            UploadStore::Disk(dir) => match tokio::fs::read(Self::file(dir, document_id)).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(missing()),
                Err(e) => Err(io(e)),
            },
        }
    }

    /// Remove stored bytes. Removing an absent upload is not an error.
    pub async fn remove(&self, document_id: &str) -> Result<()> {
        match self {
            UploadStore::Memory(map) => {
                map.lock().unwrap().remove(document_id);
                Ok(())
            }
            UploadStore::Disk(dir) => match tokio::fs::remove_file(Self::file(dir, document_id)).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(io(e)),
                _ => Ok(()),
            },
        }
    }
}

fn io(err: std::io::Error) -> Error {
    Error::Storage(err.to_string())
}
