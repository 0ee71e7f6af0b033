//! Receiver-side reassembly and the immutable artifact it produces.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use tracing::info;
use uuid::Uuid;

use super::frame::TransferDescriptor;
use crate::utils::atomic_write::{atomic_write, unique_path};
use crate::utils::format::sanitize_file_name;

/// Chunks received between the descriptor and the done frame, in arrival
/// order. Owned by one receiver session and never read before completion.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    chunks: Vec<Bytes>,
    received: u64,
}

impl ReassemblyBuffer {
    pub fn push(&mut self, chunk: Bytes) {
        self.received += chunk.len() as u64;
        self.chunks.push(chunk);
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn frames(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Drops every buffered chunk.
    pub fn clear(&mut self) {
        self.chunks = Vec::new();
        self.received = 0;
    }

    /// Concatenates and empties the buffer.
    pub fn assemble(&mut self) -> Bytes {
        let chunks = std::mem::take(&mut self.chunks);
        self.received = 0;
        match chunks.len() {
            0 => Bytes::new(),
            1 => chunks.into_iter().next().unwrap_or_default(),
            _ => {
                let total = chunks.iter().map(Bytes::len).sum();
                let mut out = BytesMut::with_capacity(total);
                for chunk in chunks {
                    out.extend_from_slice(&chunk);
                }
                out.freeze()
            }
        }
    }
}

/// Locally resolvable handle for a received artifact, rendered as
/// `artifact:<uuid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactRef(Uuid);

impl ArtifactRef {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ArtifactRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "artifact:{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub reference: ArtifactRef,
    pub descriptor: TransferDescriptor,
    pub data: Bytes,
    pub received_at: SystemTime,
}

impl Artifact {
    pub fn new(descriptor: TransferDescriptor, data: Bytes) -> Self {
        Self {
            reference: ArtifactRef::new(),
            descriptor,
            data,
            received_at: SystemTime::now(),
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Writes the artifact into `dir` under its sanitized name, never
    /// overwriting an existing file. Returns the final path.
    pub async fn save_to(&self, dir: &Path) -> Result<PathBuf> {
        let name = sanitize_file_name(&self.descriptor.name);
        let dir = dir.to_path_buf();
        let data = self.data.clone();
        let path = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let path = unique_path(&dir, &name.to_string_lossy());
            atomic_write(&path, &data)?;
            Ok(path)
        })
        .await
        .context("Artifact writer task panicked")??;

        info!(
            event = "artifact_saved",
            artifact = %self.reference,
            path = %path.display(),
            bytes = self.len(),
            "Artifact written to disk"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, size: u64) -> TransferDescriptor {
        TransferDescriptor {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            size,
            mime: "text/plain".to_string(),
        }
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("roomdrop_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn assemble_preserves_arrival_order() {
        let mut buf = ReassemblyBuffer::default();
        buf.push(Bytes::from_static(b"ab"));
        buf.push(Bytes::from_static(b"cd"));
        buf.push(Bytes::from_static(b"e"));
        assert_eq!(buf.received(), 5);
        assert_eq!(buf.frames(), 3);

        assert_eq!(&buf.assemble()[..], b"abcde");
        assert!(buf.is_empty());
        assert_eq!(buf.received(), 0);
    }

    #[test]
    fn clear_releases_everything() {
        let mut buf = ReassemblyBuffer::default();
        buf.push(Bytes::from(vec![1u8; 64]));
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.received(), 0);
        assert!(buf.assemble().is_empty());
    }

    #[test]
    fn reference_renders_with_scheme() {
        let r = ArtifactRef::new();
        assert!(r.to_string().starts_with("artifact:"));
        assert_ne!(r, ArtifactRef::new());
    }

    #[tokio::test]
    async fn save_sanitizes_and_never_overwrites() {
        let dir = test_dir("artifact_save");
        let artifact = Artifact::new(
            descriptor("../notes.txt", 5),
            Bytes::from_static(b"hello"),
        );

        let first = artifact.save_to(&dir).await.unwrap();
        let second = artifact.save_to(&dir).await.unwrap();

        assert_eq!(first, dir.join("notes.txt"));
        assert_eq!(second, dir.join("notes (1).txt"));
        assert_eq!(std::fs::read(&first).unwrap(), b"hello");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
