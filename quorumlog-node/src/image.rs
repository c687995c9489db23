//! Bulk image transfer.
//!
//! An image is a full checkpoint of the namespace as of some txid. Readers
//! bootstrap from the latest image and then tail the log from the txid after
//! it. Images are opaque byte streams here.

use crate::error::NodeError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

/// Metadata stored next to each image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    /// Last txid reflected in the image.
    pub txid: u64,
    pub size_bytes: u64,
    /// Hex SHA-256 of the image bytes.
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

/// Moves full images between a node and shared storage.
pub trait ImageTransfer: Send + Sync {
    /// Returns the newest image, verified against its digest.
    fn fetch_latest(&self) -> Result<Option<(ImageMeta, Box<dyn Read + Send>)>, NodeError>;

    /// Stores an image taken at `txid`.
    fn upload(&self, txid: u64, stream: &mut dyn Read) -> Result<ImageMeta, NodeError>;
}

/// Image store backed by a local directory.
pub struct DirImageStore {
    dir: PathBuf,
    upload_lock: Mutex<()>,
}

impl DirImageStore {
    /// Opens or creates an image store at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, NodeError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            upload_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lists stored images, oldest first.
    pub fn list(&self) -> Result<Vec<ImageMeta>, NodeError> {
        let mut images = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("image_") && n.ends_with(".json"))
                .unwrap_or(false);
            if !is_meta {
                continue;
            }
            let reader = BufReader::new(File::open(&path)?);
            images.push(serde_json::from_reader::<_, ImageMeta>(reader)?);
        }
        images.sort_by_key(|m| m.txid);
        Ok(images)
    }

    /// Txid of the newest image, if any.
    pub fn latest_txid(&self) -> Result<Option<u64>, NodeError> {
        Ok(self.list()?.last().map(|m| m.txid))
    }

    /// Deletes all but the newest `retain` images. Returns how many were removed.
    pub fn purge_old_images(&self, retain: usize) -> Result<usize, NodeError> {
        let images = self.list()?;
        let excess = images.len().saturating_sub(retain);
        for meta in &images[..excess] {
            fs::remove_file(self.meta_path(meta.txid))?;
            let data = self.image_path(meta.txid);
            if data.exists() {
                fs::remove_file(data)?;
            }
            tracing::info!("Purged image at txid {}", meta.txid);
        }
        Ok(excess)
    }

    fn image_path(&self, txid: u64) -> PathBuf {
        self.dir.join(format!("image_{:016x}", txid))
    }

    fn meta_path(&self, txid: u64) -> PathBuf {
        self.dir.join(format!("image_{:016x}.json", txid))
    }
}

impl ImageTransfer for DirImageStore {
    fn fetch_latest(&self) -> Result<Option<(ImageMeta, Box<dyn Read + Send>)>, NodeError> {
        let Some(meta) = self.list()?.pop() else {
            return Ok(None);
        };

        let mut data = Vec::with_capacity(meta.size_bytes as usize);
        File::open(self.image_path(meta.txid))?.read_to_end(&mut data)?;
        let actual = hex::encode(Sha256::digest(&data));
        if actual != meta.sha256 {
            return Err(NodeError::ImageCorrupted {
                txid: meta.txid,
                expected: meta.sha256,
                actual,
            });
        }

        tracing::info!(
            "Fetched image at txid {} ({} bytes)",
            meta.txid,
            meta.size_bytes
        );
        Ok(Some((meta, Box::new(Cursor::new(data)))))
    }

    fn upload(&self, txid: u64, stream: &mut dyn Read) -> Result<ImageMeta, NodeError> {
        let _guard = self.upload_lock.lock();
        let final_path = self.image_path(txid);
        if self.meta_path(txid).exists() {
            return Err(NodeError::ImageExists(txid));
        }

        let tmp_path = self.dir.join(format!("image_{:016x}.tmp", txid));
        let mut hasher = Sha256::new();
        let mut size_bytes = 0u64;
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            let mut chunk = [0u8; 64 * 1024];
            loop {
                let n = stream.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                hasher.update(&chunk[..n]);
                writer.write_all(&chunk[..n])?;
                size_bytes += n as u64;
            }
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;

        let meta = ImageMeta {
            txid,
            size_bytes,
            sha256: hex::encode(hasher.finalize()),
            created_at: Utc::now(),
        };
        let writer = BufWriter::new(File::create(self.meta_path(txid))?);
        serde_json::to_writer_pretty(writer, &meta)?;

        tracing::info!("Uploaded image at txid {} ({} bytes)", txid, size_bytes);
        Ok(meta)
    }
}
