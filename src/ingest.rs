//! Reference document ingestion.
//!
//! Markdown is taken verbatim. JSON is parsed and re-emitted pretty-printed so
//! personas always see a normalized form. The digest covers the bytes on disk.

use std::path::{Path, PathBuf};

use pipewright_common::{InputDocument, MediaType};
use tracing::debug;

use crate::config::absolutize;
use crate::errors::IngestError;
use crate::util::sha256_hex;

pub fn read_document(path: &Path) -> Result<InputDocument, IngestError> {
    let path = absolutize(path);
    let media_type = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(MediaType::from_extension)
        .ok_or_else(|| IngestError::Unsupported { path: path.clone() })?;

    let raw = std::fs::read(&path).map_err(|source| IngestError::Read {
        path: path.clone(),
        source,
    })?;
    let text = String::from_utf8(raw.clone()).map_err(|e| IngestError::Read {
        path: path.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;

    let content = match media_type {
        MediaType::Markdown => text,
        MediaType::Json => {
            let value: serde_json::Value =
                serde_json::from_str(&text).map_err(|source| IngestError::InvalidJson {
                    path: path.clone(),
                    source,
                })?;
            serde_json::to_string_pretty(&value).map_err(|source| IngestError::InvalidJson {
                path: path.clone(),
                source,
            })?
        }
    };

    if content.trim().is_empty() {
        return Err(IngestError::Empty { path });
    }

    debug!(path = %path.display(), media_type = %media_type, bytes = raw.len(), "Loaded document");
    Ok(InputDocument {
        sha256: sha256_hex(&raw),
        path,
        media_type,
        content,
    })
}

pub fn load_documents(paths: &[PathBuf]) -> Result<Vec<InputDocument>, IngestError> {
    paths.iter().map(|p| read_document(p)).collect()
}
