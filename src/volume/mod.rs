//! The Volume Manager: maps portable virtual paths to physical OS
//! paths, gates every access behind a permission bitset, and keeps file
//! metadata in the Record Store.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{NetfsError, Result};
use crate::record::{eq, Limit, Record, Store};

/// Name of the `volume` table in the Record Store.
pub const VOLUME_TABLE: &str = "volume";
/// Name of the `volume_file` table in the Record Store.
pub const VOLUME_FILE_TABLE: &str = "volume_file";

// volume_file field indices.
const F_FILE_PATH: usize = 0;
const F_PARENT_PATH: usize = 1;
const F_NAME: usize = 2;
const F_TYPE: usize = 3;
const F_SIZE: usize = 4;

/// Read/write permission bitset (§3 Data Model).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Perm(u8);

impl Perm {
    pub const READ: Perm = Perm(0b01);
    pub const WRITE: Perm = Perm(0b10);

    pub const fn none() -> Perm {
        Perm(0)
    }

    pub const fn union(self, other: Perm) -> Perm {
        Perm(self.0 | other.0)
    }

    pub fn contains(self, other: Perm) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Perm {
        Perm(bits)
    }
}

/// FILE vs DIRECTORY, as recorded in `volume_file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
}

impl FileType {
    fn to_byte(self) -> u8 {
        match self {
            FileType::File => 0,
            FileType::Directory => 1,
        }
    }

    fn from_byte(b: u8) -> FileType {
        if b == 1 {
            FileType::Directory
        } else {
            FileType::File
        }
    }
}

/// Metadata describing a file or directory addressed by its virtual path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub virtual_path: String,
    pub file_type: FileType,
    pub size: i64,
    pub parent_path: String,
}

impl FileInfo {
    fn to_record(&self, table: &crate::record::Table) -> Record {
        let mut record = Record::new(5);
        record.set_record_id(table.next_id());
        record.set_field(F_FILE_PATH, self.virtual_path.as_bytes().to_vec());
        record.set_field(F_PARENT_PATH, self.parent_path.as_bytes().to_vec());
        record.set_field(F_NAME, self.name.as_bytes().to_vec());
        record.set_field(F_TYPE, vec![self.file_type.to_byte()]);
        record.set_field_u64(F_SIZE, self.size as u64);
        record
    }

    fn from_record(record: &Record) -> FileInfo {
        FileInfo {
            name: String::from_utf8_lossy(record.field(F_NAME)).into_owned(),
            virtual_path: String::from_utf8_lossy(record.field(F_FILE_PATH)).into_owned(),
            file_type: FileType::from_byte(record.field(F_TYPE).first().copied().unwrap_or(0)),
            size: record.field_u64(F_SIZE) as i64,
            parent_path: String::from_utf8_lossy(record.field(F_PARENT_PATH)).into_owned(),
        }
    }
}

/// Splits a virtual path `<name>:/<sub>` into its volume name and subpath.
///
/// `<volName>` is required to contain no `:`; splitting on the *first*
/// colon is therefore unambiguous.
fn split_virtual_path(vp: &str) -> Result<(&str, &str)> {
    vp.split_once(':').ok_or_else(|| NetfsError::MalformedVirtualPath(vp.to_string()))
}

/// A named, permission-gated root mapping virtual paths to OS paths.
pub struct Volume {
    name: String,
    os_path: PathBuf,
    perm: Perm,
    store: Store,
}

impl Volume {
    fn require(&self, perm: Perm) -> Result<()> {
        if self.perm.contains(perm) {
            Ok(())
        } else if perm.contains(Perm::WRITE) {
            Err(NetfsError::WriteNotPermitted(self.name.clone()))
        } else {
            Err(NetfsError::ReadNotPermitted(self.name.clone()))
        }
    }

    fn table(&self) -> std::sync::Arc<crate::record::Table> {
        self.store.table(VOLUME_FILE_TABLE)
    }

    /// Resolves a virtual path to its OS path by stripping the `<name>:`
    /// prefix and joining the remainder onto `os_path`.
    pub fn resolve_path(&self, vp: &str) -> Result<PathBuf> {
        let (_, sub) = split_virtual_path(vp)?;
        Ok(self.os_path.join(sub.trim_start_matches('/')))
    }

    /// Looks up metadata for a single virtual path.
    pub fn info(&self, vp: &str) -> Result<FileInfo> {
        self.require(Perm::READ)?;
        let rows = self.table().get(&[eq(F_FILE_PATH, vp.as_bytes().to_vec())], Some(Limit(1)));
        rows.first().map(FileInfo::from_record).ok_or_else(|| NetfsError::FileNotFound(vp.to_string()))
    }

    /// Lists the children of a directory, ordered by `record_id` ascending,
    /// windowed by `skip`/`limit`.
    pub fn children(&self, vp: &str, skip: usize, limit: usize) -> Result<Vec<FileInfo>> {
        self.require(Perm::READ)?;
        let rows = self.table().get(&[eq(F_PARENT_PATH, vp.as_bytes().to_vec())], None);
        Ok(rows.iter().skip(skip).take(limit).map(FileInfo::from_record).collect())
    }

    /// Creates a file or directory, recursively creating any missing
    /// intermediate directories and recording metadata rows for each new
    /// directory that doesn't already have one. Idempotent for directories;
    /// truncate-and-create for files.
    pub async fn create(&self, info: &FileInfo) -> Result<()> {
        self.require(Perm::WRITE)?;

        let os_path = self.resolve_path(&info.virtual_path)?;
        self.ensure_ancestors(&info.virtual_path, &os_path).await?;

        match info.file_type {
            FileType::Directory => {
                fs::create_dir_all(&os_path).await?;
            }
            FileType::File => {
                if let Some(parent) = os_path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::File::create(&os_path).await?;
            }
        }

        self.upsert_row(info);
        Ok(())
    }

    /// Synthesizes metadata rows for any intermediate directory on the path
    /// to `vp` that doesn't already have one recorded.
    async fn ensure_ancestors(&self, vp: &str, os_path: &Path) -> Result<()> {
        let (volume_name, sub) = split_virtual_path(vp)?;
        let sub = sub.trim_start_matches('/');

        let segments: Vec<&str> = sub.split('/').filter(|s| !s.is_empty()).collect();
        let ancestors = if segments.is_empty() { &segments[..] } else { &segments[..segments.len() - 1] };

        let mut built = String::new();
        let mut parent = format!("{volume_name}:/");
        for segment in ancestors {
            if !built.is_empty() {
                built.push('/');
            }
            built.push_str(segment);
            let dir_vp = format!("{volume_name}:/{built}");

            if self.table().get(&[eq(F_FILE_PATH, dir_vp.as_bytes().to_vec())], Some(Limit(1))).is_empty() {
                self.upsert_row(&FileInfo {
                    name: segment.to_string(),
                    virtual_path: dir_vp.clone(),
                    file_type: FileType::Directory,
                    size: 0,
                    parent_path: parent.clone(),
                });
            }
            parent = dir_vp;
        }

        if let Some(os_parent) = os_path.parent() {
            fs::create_dir_all(os_parent).await?;
        }
        Ok(())
    }

    fn upsert_row(&self, info: &FileInfo) {
        let table = self.table();
        let existing = table.get(&[eq(F_FILE_PATH, info.virtual_path.as_bytes().to_vec())], Some(Limit(1)));

        let mut record = info.to_record(&table);
        if let Some(found) = existing.first() {
            record.set_record_id(found.record_id());
        }
        table.set(record);
    }

    /// Positional read: returns up to `min(size, file_size - offset)` bytes.
    /// Short reads at EOF are normal, not errors.
    pub async fn read(&self, vp: &str, offset: i64, size: i64) -> Result<Vec<u8>> {
        self.require(Perm::READ)?;
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let os_path = self.resolve_path(vp)?;
        let mut file = fs::File::open(&os_path).await?;
        file.seek(std::io::SeekFrom::Start(offset as u64)).await?;

        let mut buf = vec![0u8; size.max(0) as usize];
        let mut read_total = 0usize;
        while read_total < buf.len() {
            let n = file.read(&mut buf[read_total..]).await?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        buf.truncate(read_total);
        Ok(buf)
    }

    /// Appends `bytes` to the file, then updates the row's `size`. Disk
    /// write happens before the metadata update (best-effort: a crash
    /// between the two is recoverable by a startup scan, not implemented
    /// here since the store is in-memory and process-scoped).
    ///
    /// Concurrent writers on the same virtual path are not serialized by
    /// this layer, callers that need exclusivity must arrange it
    /// themselves.
    pub async fn write(&self, vp: &str, bytes: &[u8]) -> Result<()> {
        self.require(Perm::WRITE)?;
        use tokio::io::AsyncWriteExt;

        let os_path = self.resolve_path(vp)?;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&os_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;

        let mut info = self.info(vp).unwrap_or_else(|_| {
            let (name, parent) = name_and_parent(vp);
            FileInfo { name, virtual_path: vp.to_string(), file_type: FileType::File, size: 0, parent_path: parent }
        });
        info.size += bytes.len() as i64;
        self.upsert_row(&info);
        Ok(())
    }

    /// Deletes the OS object (recursively for directories) and its
    /// metadata row(s).
    pub async fn remove(&self, vp: &str) -> Result<()> {
        self.require(Perm::WRITE)?;

        let info = self.info(vp)?;
        let os_path = self.resolve_path(vp)?;

        match info.file_type {
            FileType::Directory => {
                if fs::try_exists(&os_path).await? {
                    fs::remove_dir_all(&os_path).await?;
                }
                let descendants = self.table().get(&[], None);
                for row in descendants {
                    let row_info = FileInfo::from_record(&row);
                    if row_info.virtual_path == vp || row_info.virtual_path.starts_with(&format!("{vp}/")) {
                        self.table().del(&[eq(F_FILE_PATH, row_info.virtual_path.as_bytes().to_vec())]);
                    }
                }
            }
            FileType::File => {
                if fs::try_exists(&os_path).await? {
                    fs::remove_file(&os_path).await?;
                }
                self.table().del(&[eq(F_FILE_PATH, vp.as_bytes().to_vec())]);
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn perm(&self) -> Perm {
        self.perm
    }
}

pub(crate) fn name_and_parent(vp: &str) -> (String, String) {
    match vp.rsplit_once('/') {
        Some((parent, name)) => (name.to_string(), parent.to_string()),
        None => (vp.to_string(), String::new()),
    }
}

/// Immutable, created-at-configuration registry of [`Volume`]s.
#[derive(Clone)]
pub struct VolumeManager {
    store: Store,
    volumes: Vec<(String, PathBuf, Perm)>,
}

impl VolumeManager {
    /// Creates a manager over the given volume definitions. Volumes are
    /// immutable for the lifetime of the manager, there is no runtime
    /// `AddVolume`.
    pub fn new(store: Store, volumes: Vec<(String, PathBuf, Perm)>) -> Self {
        Self { store, volumes }
    }

    /// Resolves a virtual path's `<name>` prefix to its owning [`Volume`].
    pub fn volume(&self, vp: &str) -> Result<Volume> {
        let (name, _) = split_virtual_path(vp)?;
        let (vol_name, os_path, perm) =
            self.volumes.iter().find(|(n, _, _)| n == name).ok_or_else(|| NetfsError::VolumeNotFound(name.to_string()))?;

        Ok(Volume { name: vol_name.clone(), os_path: os_path.clone(), perm: *perm, store: self.store.clone() })
    }
}
