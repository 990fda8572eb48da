use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use reqwest::{Method, StatusCode};
use tokio::io::AsyncReadExt;

use crate::storage::{DeleteOutcome, ObjectMeta, ObjectStore};

use super::client::{AzureBlobClient, error_code, request_id};

/// Files at or above this size go up as staged blocks (64 MB).
const BLOCK_UPLOAD_THRESHOLD: u64 = 64 * 1024 * 1024;

/// Size of each staged block (8 MB).
const BLOCK_SIZE: usize = 8 * 1024 * 1024;

#[async_trait]
impl ObjectStore for AzureBlobClient {
    /// HEAD (Get Blob Properties).
    async fn metadata(&self, container: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let url = self.blob_url(container, key, &[])?;
        let resp = self
            .request(Method::HEAD, url)
            .send()
            .await
            .with_context(|| format!("Failed to get properties of {container}/{key}"))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let last_modified_ms = resp
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.timestamp_millis());
        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        Ok(Some(ObjectMeta {
            last_modified_ms,
            size,
        }))
    }

    /// Upload a local file, choosing a single Put Blob or staged blocks.
    async fn upload(&self, container: &str, key: &str, local_path: &Path) -> Result<Option<String>> {
        let metadata = tokio::fs::metadata(local_path)
            .await
            .with_context(|| format!("Cannot stat {}", local_path.display()))?;

        if metadata.len() >= BLOCK_UPLOAD_THRESHOLD {
            return self.upload_blocks(container, key, local_path).await;
        }

        let file_bytes = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("Failed to read {}", local_path.display()))?;

        let url = self.blob_url(container, key, &[])?;
        let resp = self
            .request(Method::PUT, url)
            .header("x-ms-blob-type", "BlockBlob")?
            .header("content-type", "application/octet-stream")?
            .body(Bytes::from(file_bytes))
            .send()
            .await
            .with_context(|| format!("Failed to upload {container}/{key}"))?;

        if resp.status() == StatusCode::NOT_FOUND {
            anyhow::bail!("Container '{container}' not found ({})", error_code(&resp));
        }

        Ok(request_id(&resp))
    }

    /// DELETE (Delete Blob). A missing blob is reported, not failed.
    async fn delete(&self, container: &str, key: &str) -> Result<DeleteOutcome> {
        let url = self.blob_url(container, key, &[])?;
        let resp = self
            .request(Method::DELETE, url)
            .send()
            .await
            .with_context(|| format!("Failed to delete {container}/{key}"))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(DeleteOutcome::NotFound);
        }

        Ok(DeleteOutcome::Deleted {
            request_id: request_id(&resp),
        })
    }
}

impl AzureBlobClient {
    /// Stage the file as fixed-size blocks, then commit the block list.
    async fn upload_blocks(
        &self,
        container: &str,
        key: &str,
        local_path: &Path,
    ) -> Result<Option<String>> {
        let mut file = tokio::fs::File::open(local_path)
            .await
            .with_context(|| format!("Cannot open {}", local_path.display()))?;

        let mut block_ids = Vec::new();
        let mut buf = vec![0u8; BLOCK_SIZE];

        loop {
            let n = read_chunk(&mut file, &mut buf).await?;
            if n == 0 {
                break;
            }

            let block_id = block_id(block_ids.len());
            let url = self.blob_url(
                container,
                key,
                &[("comp", "block"), ("blockid", block_id.as_str())],
            )?;
            let resp = self
                .request(Method::PUT, url)
                .body(Bytes::copy_from_slice(&buf[..n]))
                .send()
                .await
                .with_context(|| {
                    format!("Failed to stage block {} of {container}/{key}", block_ids.len())
                })?;
            if resp.status() == StatusCode::NOT_FOUND {
                anyhow::bail!("Container '{container}' not found ({})", error_code(&resp));
            }

            tracing::trace!(key, block = block_ids.len(), bytes = n, "staged block");
            block_ids.push(block_id);
        }

        let url = self.blob_url(container, key, &[("comp", "blocklist")])?;
        let resp = self
            .request(Method::PUT, url)
            .header("content-type", "application/xml")?
            .body(Bytes::from(block_list_xml(&block_ids)))
            .send()
            .await
            .with_context(|| format!("Failed to commit block list of {container}/{key}"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            anyhow::bail!("Container '{container}' not found ({})", error_code(&resp));
        }

        tracing::debug!(key, blocks = block_ids.len(), "block upload committed");
        Ok(request_id(&resp))
    }
}

/// Fill `buf` from `file`, short only at end of file.
async fn read_chunk(file: &mut tokio::fs::File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Block ids must all have the same length within a blob.
fn block_id(index: usize) -> String {
    STANDARD.encode(format!("block-{index:06}"))
}

fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in block_ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}
