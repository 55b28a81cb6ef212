//! In-memory codec for testing.
//!
//! Decoded containers live in a map keyed by path. Installing or saving a
//! container also writes a small stub file carrying the right signature, so
//! signature sniffing and file-system checks behave as with real files.
//! Extraction and staged saves do real file I/O.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::ContainerCodec;
use crate::types::{
    AudioId, BankData, BankHeader, ContainerData, HierarchyEntry, HierarchySection, IndexEntry,
    IndexSection, PackageData, PackageEntry, PackageHeader, PayloadSection, Section, SectionKind,
};

/// Error type for the in-memory codec.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryCodecError {
    /// No container installed at this path.
    #[error("Container not found: {}", .0.display())]
    NotFound(PathBuf),
    /// Staging dir lacks the bytes for an entry.
    #[error("Staged audio missing for id {id} in {}", .dir.display())]
    MissingStaged {
        /// Entry id.
        id: u32,
        /// Staging dir.
        dir: PathBuf,
    },
    /// File I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
struct StoredContainer {
    data: ContainerData,
    /// Embedded package bytes, addressed by entry offset * block size.
    package_payload: Vec<u8>,
}

/// In-memory codec for testing.
#[derive(Debug)]
pub struct InMemoryCodec {
    native_extension: String,
    files: RwLock<HashMap<PathBuf, StoredContainer>>,
    extractions: Mutex<HashMap<PathBuf, usize>>,
    extract_delay: Duration,
    write_pause: Duration,
}

impl Default for InMemoryCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCodec {
    /// Create an empty codec writing `.wem` files.
    pub fn new() -> Self {
        Self {
            native_extension: "wem".to_string(),
            files: RwLock::new(HashMap::new()),
            extractions: Mutex::new(HashMap::new()),
            extract_delay: Duration::ZERO,
            write_pause: Duration::ZERO,
        }
    }

    /// Make every extraction sleep first, to widen race windows in tests.
    pub fn with_extract_delay(mut self, delay: Duration) -> Self {
        self.extract_delay = delay;
        self
    }

    /// Write each extracted entry in two steps, its first byte then the
    /// rest, pausing in between.
    pub fn with_write_pause(mut self, pause: Duration) -> Self {
        self.write_pause = pause;
        self
    }

    /// Build a bank from hierarchy entries and audio bytes.
    ///
    /// With `embed` set, `audio` fills the index and payload sections.
    /// Otherwise the bank has neither and its audio is expected to be
    /// streamed from elsewhere.
    pub fn pack_bank(hierarchy: Vec<HierarchyEntry>, audio: &[(AudioId, Vec<u8>)], embed: bool) -> BankData {
        let mut index = IndexSection::default();
        let mut payload = Vec::new();
        for (id, bytes) in audio {
            index.entries.push(IndexEntry {
                id: id.get(),
                offset: payload.len() as u32,
                length: bytes.len() as u32,
            });
            payload.extend_from_slice(bytes);
        }

        let mut sections = vec![Section::Header(BankHeader {
            version: 140,
            bank_id: 0,
            data: vec![],
        })];
        if embed {
            sections.push(Section::Index(index));
        }
        sections.push(Section::Hierarchy(HierarchySection { entries: hierarchy }));
        if embed {
            sections.push(Section::Payload(PayloadSection { data: payload }));
        }
        BankData { sections }
    }

    /// Build a package listing `audio`, returning the payload bytes to
    /// install alongside it.
    pub fn pack_package(audio: &[(AudioId, Vec<u8>)], embed: bool) -> (PackageData, Vec<u8>) {
        let mut entries = Vec::with_capacity(audio.len());
        let mut payload = Vec::new();
        for (id, bytes) in audio {
            entries.push(PackageEntry {
                id: id.get(),
                block_size: 1,
                length: bytes.len() as u32,
                offset: payload.len() as u32,
                language_id: 0,
            });
            if embed {
                payload.extend_from_slice(bytes);
            }
        }

        let package = PackageData {
            header: PackageHeader {
                version: 1,
                string_table: [(0, "sfx".to_string())].into_iter().collect(),
                entries,
            },
            has_payload: embed,
        };
        (package, payload)
    }

    /// Register a container and write its stub file.
    pub async fn install(
        &self,
        path: &Path,
        data: ContainerData,
        package_payload: Vec<u8>,
    ) -> Result<(), InMemoryCodecError> {
        write_stub(path, &data).await?;
        self.files.write().insert(
            path.to_path_buf(),
            StoredContainer {
                data,
                package_payload,
            },
        );
        Ok(())
    }

    /// Number of whole-container extractions run for `path`.
    pub fn extraction_count(&self, path: &Path) -> usize {
        self.extractions.lock().get(path).copied().unwrap_or(0)
    }

    /// Decoded contents stored at `path`.
    pub fn stored(&self, path: &Path) -> Option<ContainerData> {
        self.files.read().get(path).map(|stored| stored.data.clone())
    }

    /// Embedded bytes of one audio entry stored at `path`.
    pub fn audio_bytes(&self, path: &Path, id: AudioId) -> Option<Vec<u8>> {
        let files = self.files.read();
        let stored = files.get(path)?;
        embedded_audio(stored)
            .into_iter()
            .find(|(entry_id, _)| *entry_id == id.get())
            .map(|(_, bytes)| bytes.to_vec())
    }

    fn get(&self, path: &Path) -> Result<StoredContainer, InMemoryCodecError> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| InMemoryCodecError::NotFound(path.to_path_buf()))
    }

    fn staged_path(&self, dir: &Path, id: u32) -> PathBuf {
        dir.join(format!("{}.{}", id, self.native_extension))
    }
}

/// Every `(id, bytes)` pair with embedded bytes, in entry order.
fn embedded_audio(stored: &StoredContainer) -> Vec<(u32, &[u8])> {
    match &stored.data {
        ContainerData::Bank(bank) => {
            let (Some(index), Some(payload)) = (bank.index(), bank.payload()) else {
                return Vec::new();
            };
            index
                .entries
                .iter()
                .filter(|entry| entry.length > 0)
                .filter_map(|entry| {
                    let start = entry.offset as usize;
                    let end = start + entry.length as usize;
                    payload.data.get(start..end).map(|bytes| (entry.id, bytes))
                })
                .collect()
        }
        ContainerData::Package(package) if package.has_payload => package
            .header
            .entries
            .iter()
            .filter(|entry| entry.length > 0)
            .filter_map(|entry| {
                let start = entry.offset as usize * entry.block_size.max(1) as usize;
                let end = start + entry.length as usize;
                stored.package_payload.get(start..end).map(|bytes| (entry.id, bytes))
            })
            .collect(),
        ContainerData::Package(_) => Vec::new(),
    }
}

async fn write_stub(path: &Path, data: &ContainerData) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut stub = data.kind().signature().to_vec();
    stub.extend_from_slice(&[0u8; 4]);
    tokio::fs::write(path, stub).await
}

#[async_trait]
impl ContainerCodec for InMemoryCodec {
    type Error = InMemoryCodecError;

    async fn load(
        &self,
        path: &Path,
        filter: Option<&[SectionKind]>,
    ) -> Result<ContainerData, Self::Error> {
        let stored = self.get(path)?;
        Ok(match (stored.data, filter) {
            (ContainerData::Bank(mut bank), Some(filter)) => {
                bank.sections
                    .retain(|s| s.kind().map(|kind| filter.contains(&kind)).unwrap_or(false));
                ContainerData::Bank(bank)
            }
            (data, _) => data,
        })
    }

    async fn extract_whole_container(&self, path: &Path, output_dir: &Path) -> Result<(), Self::Error> {
        *self.extractions.lock().entry(path.to_path_buf()).or_insert(0) += 1;
        if !self.extract_delay.is_zero() {
            tokio::time::sleep(self.extract_delay).await;
        }

        let stored = self.get(path)?;
        tokio::fs::create_dir_all(output_dir).await?;
        for (id, bytes) in embedded_audio(&stored) {
            let target = self.staged_path(output_dir, id);
            if !self.write_pause.is_zero() && bytes.len() > 1 {
                tokio::fs::write(&target, &bytes[..1]).await?;
                tokio::time::sleep(self.write_pause).await;
            }
            tokio::fs::write(&target, bytes).await?;
        }
        Ok(())
    }

    async fn save(
        &self,
        data: &ContainerData,
        destination: &Path,
        staging_dir: Option<&Path>,
    ) -> Result<(), Self::Error> {
        let mut data = data.clone();
        let mut package_payload = Vec::new();

        match (&mut data, staging_dir) {
            (ContainerData::Bank(bank), Some(dir)) if bank.has_payload() => {
                let mut blob = Vec::new();
                let entries = bank.ensure_index();
                for entry in entries.entries.iter_mut() {
                    let staged = self.staged_path(dir, entry.id);
                    let bytes = tokio::fs::read(&staged)
                        .await
                        .map_err(|_| InMemoryCodecError::MissingStaged {
                            id: entry.id,
                            dir: dir.to_path_buf(),
                        })?;
                    entry.offset = blob.len() as u32;
                    entry.length = bytes.len() as u32;
                    blob.extend_from_slice(&bytes);
                }
                for section in bank.sections.iter_mut() {
                    if let Section::Payload(payload) = section {
                        payload.data = std::mem::take(&mut blob);
                    }
                }
            }
            (ContainerData::Package(package), Some(dir)) => {
                let was_embedded = package.has_payload;
                for entry in package.header.entries.iter_mut() {
                    match tokio::fs::read(self.staged_path(dir, entry.id)).await {
                        Ok(bytes) => {
                            entry.block_size = 1;
                            entry.offset = package_payload.len() as u32;
                            entry.length = bytes.len() as u32;
                            package_payload.extend_from_slice(&bytes);
                        }
                        // Streamed entries stay external
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !was_embedded => {
                            entry.length = 0;
                        }
                        Err(_) => {
                            return Err(InMemoryCodecError::MissingStaged {
                                id: entry.id,
                                dir: dir.to_path_buf(),
                            })
                        }
                    }
                }
                package.has_payload = was_embedded || !package_payload.is_empty();
            }
            // Direct saves only happen for containers without embedded bytes
            _ => {}
        }

        self.install(destination, data, package_payload).await
    }
}
