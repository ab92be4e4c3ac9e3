//! Upload sources.
//!
//! The chunked uploader needs random access over the content so workers can
//! read disjoint ranges in any order. Files and in-memory buffers have that
//! already; stream-once sources (pipes, response bodies) are spooled into
//! memory when small or into a single temp file otherwise, with the MD5
//! computed during spooling so the bytes are read exactly once.

use std::io::SeekFrom;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use md5::{Digest, Md5};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::debug;

use crate::{Result, TransferError};

/// Spool threshold: streams up to this size stay in memory.
pub const SPOOL_MEMORY_LIMIT: u64 = 100 * 1024 * 1024;

/// Prefix for spool files under the system temp directory.
const SPOOL_PREFIX: &str = "rclone-123pan-chunk-";

pub enum UploadSource {
    /// Re-openable file on disk.
    File(Utf8PathBuf),
    /// Whole content already in memory.
    Memory(Bytes),
    /// Read-once stream with an optional declared size.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl UploadSource {
    pub fn is_reopenable(&self) -> bool {
        !matches!(self, UploadSource::Stream(_))
    }
}

enum Backing {
    File { file: Mutex<File>, len: u64 },
    Memory(Bytes),
    /// Spooled temp file; removed on drop.
    Spooled {
        file: Mutex<File>,
        path: Utf8PathBuf,
        len: u64,
    },
}

/// Random-access view over an upload source. Cheap range reads, a known
/// length, and an MD5 that is either computed during spooling or by one
/// sequential pass on demand.
pub struct RandomAccessSource {
    backing: Backing,
    md5_hex: Mutex<Option<String>>,
}

impl RandomAccessSource {
    pub async fn open(source: UploadSource) -> Result<Self> {
        match source {
            UploadSource::Memory(data) => Ok(RandomAccessSource {
                backing: Backing::Memory(data),
                md5_hex: Mutex::new(None),
            }),
            UploadSource::File(path) => {
                let file = File::open(path.as_std_path()).await?;
                let len = file.metadata().await?.len();
                Ok(RandomAccessSource {
                    backing: Backing::File {
                        file: Mutex::new(file),
                        len,
                    },
                    md5_hex: Mutex::new(None),
                })
            }
            UploadSource::Stream(stream) => Self::spool(stream).await,
        }
    }

    /// Buffers a read-once stream, hashing as it goes. Small streams stay in
    /// memory; anything larger goes to one temp file, the single unit of
    /// storage amplification.
    async fn spool(mut stream: Box<dyn AsyncRead + Send + Unpin>) -> Result<Self> {
        let mut hasher = Md5::new();
        let mut buffer = Vec::new();
        let mut chunk = vec![0u8; 256 * 1024];
        let mut spill: Option<(File, Utf8PathBuf)> = None;
        let mut total: u64 = 0;

        loop {
            let read = stream.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            hasher.update(&chunk[..read]);
            total += read as u64;
            match &mut spill {
                Some((file, _)) => file.write_all(&chunk[..read]).await?,
                None => {
                    buffer.extend_from_slice(&chunk[..read]);
                    if total > SPOOL_MEMORY_LIMIT {
                        let path = spool_path()?;
                        debug!(%path, total, "stream exceeds memory spool limit, spilling");
                        let mut file = File::create(path.as_std_path()).await?;
                        file.write_all(&buffer).await?;
                        buffer = Vec::new();
                        spill = Some((file, path));
                    }
                }
            }
        }

        let md5_hex = hex::encode(hasher.finalize());
        match spill {
            Some((mut file, path)) => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                Ok(RandomAccessSource {
                    backing: Backing::Spooled {
                        file: Mutex::new(file),
                        path,
                        len: total,
                    },
                    md5_hex: Mutex::new(Some(md5_hex)),
                })
            }
            None => Ok(RandomAccessSource {
                backing: Backing::Memory(Bytes::from(buffer)),
                md5_hex: Mutex::new(Some(md5_hex)),
            }),
        }
    }

    pub fn len(&self) -> u64 {
        match &self.backing {
            Backing::File { len, .. } => *len,
            Backing::Memory(data) => data.len() as u64,
            Backing::Spooled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads `len` bytes at `offset`, shorter at end of content.
    pub async fn read_range(&self, offset: u64, len: usize) -> Result<Bytes> {
        let total = self.len();
        if offset >= total {
            return Ok(Bytes::new());
        }
        let len = len.min((total - offset) as usize);
        match &self.backing {
            Backing::Memory(data) => Ok(data.slice(offset as usize..offset as usize + len)),
            Backing::File { file, .. } | Backing::Spooled { file, .. } => {
                let mut file = file.lock().await;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut out = vec![0u8; len];
                file.read_exact(&mut out).await?;
                Ok(Bytes::from(out))
            }
        }
    }

    /// The MD5 if it has already been computed, without forcing a pass.
    pub async fn cached_md5(&self) -> Option<String> {
        self.md5_hex.lock().await.clone()
    }

    /// MD5 of the whole content as lowercase hex. Computed once; spooled
    /// sources already know it.
    pub async fn md5_hex(&self) -> Result<String> {
        {
            let cached = self.md5_hex.lock().await;
            if let Some(md5) = cached.as_ref() {
                return Ok(md5.clone());
            }
        }
        let mut hasher = Md5::new();
        let mut offset = 0u64;
        const STEP: usize = 1024 * 1024;
        while offset < self.len() {
            let chunk = self.read_range(offset, STEP).await?;
            hasher.update(&chunk);
            offset += chunk.len() as u64;
        }
        let md5 = hex::encode(hasher.finalize());
        *self.md5_hex.lock().await = Some(md5.clone());
        Ok(md5)
    }
}

impl Drop for RandomAccessSource {
    fn drop(&mut self) {
        if let Backing::Spooled { path, .. } = &self.backing {
            let _ = std::fs::remove_file(path.as_std_path());
        }
    }
}

fn spool_path() -> Result<Utf8PathBuf> {
    let dir = std::env::temp_dir();
    let dir = Utf8Path::from_path(&dir).ok_or(TransferError::NonUtf8TempDir)?;
    let unique = format!(
        "{SPOOL_PREFIX}{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );
    Ok(dir.join(unique))
}

#[cfg(test)]
mod test {
    use anyhow::Result;

    use super::*;

    #[tokio::test]
    async fn memory_source_reads_ranges() -> Result<()> {
        let source =
            RandomAccessSource::open(UploadSource::Memory(Bytes::from_static(b"hello world")))
                .await?;
        assert_eq!(source.len(), 11);
        assert_eq!(source.read_range(6, 5).await?.as_ref(), b"world");
        assert_eq!(source.read_range(6, 100).await?.as_ref(), b"world");
        assert!(source.read_range(11, 1).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn file_source_hashes_and_reads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"abcdef")?;
        let source = RandomAccessSource::open(UploadSource::File(
            Utf8PathBuf::try_from(path)?,
        ))
        .await?;
        assert_eq!(source.len(), 6);
        // md5("abcdef")
        assert_eq!(source.md5_hex().await?, "e80b5017098950fc58aad83c8c14978e");
        assert_eq!(source.read_range(2, 2).await?.as_ref(), b"cd");
        Ok(())
    }

    #[tokio::test]
    async fn stream_source_spools_and_knows_md5() -> Result<()> {
        let data = b"stream me".to_vec();
        let source = RandomAccessSource::open(UploadSource::Stream(Box::new(
            std::io::Cursor::new(data),
        )))
        .await?;
        assert_eq!(source.len(), 9);
        // The MD5 was computed during spooling, no second pass needed.
        assert_eq!(source.md5_hex().await?, "514d2e08c72387a27d4420217482a513");
        assert_eq!(source.read_range(0, 6).await?.as_ref(), b"stream");
        Ok(())
    }
}
