//! Per-entry metadata tracked by the tree index.

use std::{
    fs::{FileType, Metadata},
    os::unix::fs::{FileTypeExt, MetadataExt},
};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::expiry::is_expired;
use crate::id::ContentId;
use crate::names::NameCache;

/// Version tag written into every record and into the metadata file.
pub const RECORD_VERSION: &str = "1";

/// Kind of filesystem object, as stored in the metadata file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    #[serde(rename = "F")]
    File,
    #[serde(rename = "D")]
    Directory,
    #[serde(rename = "L")]
    Symlink,
    #[serde(rename = "P")]
    Fifo,
    #[serde(rename = "S")]
    Socket,
    #[serde(rename = "C")]
    CharDevice,
    #[serde(rename = "B")]
    BlockDevice,
}

impl ObjectType {
    pub fn from_file_type(file_type: FileType) -> Option<Self> {
        if file_type.is_file() {
            Some(Self::File)
        } else if file_type.is_dir() {
            Some(Self::Directory)
        } else if file_type.is_symlink() {
            Some(Self::Symlink)
        } else if file_type.is_fifo() {
            Some(Self::Fifo)
        } else if file_type.is_socket() {
            Some(Self::Socket)
        } else if file_type.is_char_device() {
            Some(Self::CharDevice)
        } else if file_type.is_block_device() {
            Some(Self::BlockDevice)
        } else {
            None
        }
    }

    pub fn code(self) -> char {
        match self {
            Self::File => 'F',
            Self::Directory => 'D',
            Self::Symlink => 'L',
            Self::Fifo => 'P',
            Self::Socket => 'S',
            Self::CharDevice => 'C',
            Self::BlockDevice => 'B',
        }
    }

    /// Whether entries of this type get a content identifier.
    pub fn has_content(self) -> bool {
        matches!(self, Self::File | Self::Symlink)
    }
}

/// (device, inode): names one filesystem object regardless of its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64, pub u64);

impl FileId {
    pub fn of(meta: &Metadata) -> Self {
        Self(meta.dev(), meta.ino())
    }

    pub fn device(&self) -> u64 {
        self.0
    }

    pub fn inode(&self) -> u64 {
        self.1
    }
}

/// The parts of a stat result that must not move while content is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub mode: u32,
    pub mtime: i64,
}

impl Snapshot {
    pub fn of(meta: &Metadata) -> Self {
        Self {
            mode: meta.mode(),
            mtime: mtime_ns(meta),
        }
    }
}

fn to_ns(secs: i64, nsec: i64) -> i64 {
    secs.saturating_mul(1_000_000_000).saturating_add(nsec)
}

pub(crate) fn mtime_ns(meta: &Metadata) -> i64 {
    to_ns(meta.mtime(), meta.mtime_nsec())
}

/// One tracked filesystem entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub version: String,
    /// Root-relative, `/`-separated.
    pub path: String,
    /// Permission bits only.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub uname: Option<String>,
    pub gname: Option<String>,
    pub size: u64,
    /// Nanoseconds since the Unix epoch.
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub otype: Option<ObjectType>,
    pub fileid: FileId,
    pub cid: Option<ContentId>,
    pub expiry: Option<Timestamp>,
    /// When a scan last saw this entry.
    pub stime: Timestamp,
    /// The content id may be out of date.
    #[serde(default)]
    pub stale: bool,
    #[serde(skip)]
    pub(crate) generation: u64,
}

impl FileRecord {
    /// A record for an entry seen for the first time. It starts stale.
    pub fn new(path: String, meta: &Metadata, names: &NameCache) -> Self {
        let uid = meta.uid();
        let gid = meta.gid();
        let mut record = Self {
            version: RECORD_VERSION.to_string(),
            path,
            mode: 0,
            uid,
            gid,
            uname: names.user(uid),
            gname: names.group(gid),
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            otype: None,
            fileid: FileId::of(meta),
            cid: None,
            expiry: None,
            stime: Timestamp::now(),
            stale: true,
            generation: 0,
        };
        record.copy_stat(meta, names);
        record
    }

    /// Fold a fresh stat result into this record.
    ///
    /// Returns true if the content id needs recomputing: the modification
    /// time or file identity moved, `force` is set, or the record was
    /// already stale.
    pub fn observe(&mut self, path: &str, meta: &Metadata, names: &NameCache, force: bool) -> bool {
        if self.path != path {
            self.path = path.to_string();
        }

        let fileid = FileId::of(meta);
        if force || self.mtime != mtime_ns(meta) || self.fileid != fileid {
            self.stale = true;
        }
        self.fileid = fileid;
        self.stime = Timestamp::now();
        self.copy_stat(meta, names);

        self.stale
    }

    fn copy_stat(&mut self, meta: &Metadata, names: &NameCache) {
        self.mode = meta.mode() & 0o7777;
        if self.uid != meta.uid() || self.uname.is_none() {
            self.uid = meta.uid();
            self.uname = names.user(self.uid);
        }
        if self.gid != meta.gid() || self.gname.is_none() {
            self.gid = meta.gid();
            self.gname = names.group(self.gid);
        }
        self.size = meta.size();
        self.atime = to_ns(meta.atime(), meta.atime_nsec());
        self.mtime = mtime_ns(meta);
        self.ctime = to_ns(meta.ctime(), meta.ctime_nsec());
        self.otype = ObjectType::from_file_type(meta.file_type());
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        is_expired(self.expiry, now)
    }
}
