//! Metadata file encoding and atomic replacement.
//!
//! The metadata file is gzip-compressed JSON:
//! `{"version": "1", "item": [<record>, ...]}`.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::record::{FileRecord, RECORD_VERSION};

/// Version tag of the metadata document.
pub const STORE_VERSION: &str = "1";

/// The magic bytes at the start of a gzip stream.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Serialize)]
struct DocumentOut<'a> {
    version: &'a str,
    item: Vec<&'a FileRecord>,
}

#[derive(Deserialize)]
struct DocumentIn {
    version: String,
    item: Vec<serde_json::Value>,
}

/// Check if a file starts with the gzip magic bytes.
pub fn is_gzip_compressed(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Where the previous metadata file is kept after a save.
pub fn backup_path(path: &Path) -> PathBuf {
    sibling(path, ".bak")
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Write records as a compressed metadata document.
pub fn encode<'a, W: Write>(
    writer: W,
    records: impl IntoIterator<Item = &'a FileRecord>,
) -> Result<W> {
    let document = DocumentOut {
        version: STORE_VERSION,
        item: records.into_iter().collect(),
    };

    let mut encoder = GzEncoder::new(writer, Compression::default());
    serde_json::to_writer(&mut encoder, &document)?;
    Ok(encoder.finish()?)
}

/// Read a compressed metadata document.
///
/// Returns `None` when the document's version tag is not ours. Records
/// carrying a foreign version tag, or that fail to parse, are dropped.
pub fn decode<R: Read>(reader: R) -> std::result::Result<Option<Vec<FileRecord>>, serde_json::Error> {
    let document: DocumentIn = serde_json::from_reader(GzDecoder::new(reader))?;
    if document.version != STORE_VERSION {
        warn!(
            version = %document.version,
            expected = STORE_VERSION,
            "Ignoring metadata with unknown version"
        );
        return Ok(None);
    }

    let mut records = Vec::with_capacity(document.item.len());
    for value in document.item {
        let version = value.get("version").and_then(|v| v.as_str());
        if version != Some(RECORD_VERSION) {
            warn!(?version, "Ignoring record with unknown version");
            continue;
        }
        match serde_json::from_value::<FileRecord>(value) {
            Ok(record) => records.push(record),
            Err(err) => warn!(%err, "Ignoring unreadable record"),
        }
    }

    Ok(Some(records))
}

/// Save records to `path` so that it always holds a complete document.
///
/// The document is written to a temporary sibling and synced. The current
/// file, if any, is hard-linked to the backup path, then the temporary file
/// is renamed over `path`.
pub fn save<'a>(path: &Path, records: impl IntoIterator<Item = &'a FileRecord>) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let prefix = sibling(path, ".")
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();

    let mut temp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)?;
    debug!(temp = ?temp.path(), "Writing metadata");

    let mut writer = encode(BufWriter::new(temp.as_file_mut()), records)?;
    writer.flush()?;
    drop(writer);
    temp.as_file().sync_all()?;

    let backup = backup_path(path);
    match fs::remove_file(&backup) {
        Ok(()) => debug!(?backup, "Removed old backup"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    match fs::hard_link(path, &backup) {
        Ok(()) => debug!(?backup, "Kept previous metadata as backup"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            // Filesystems without hard links still get a backup.
            debug!(%e, "Hard link failed, copying backup");
            fs::copy(path, &backup)?;
        }
    }

    temp.persist(path).map_err(|e| e.error)?;
    info!(?path, "Saved metadata");
    Ok(())
}

/// Load records from `path`.
///
/// A missing file is `Ok(None)`. So is a corrupt or foreign-version file:
/// either way the caller has no usable prior state.
pub fn load(path: &Path) -> Result<Option<Vec<FileRecord>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(?path, "No metadata found");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    if !is_gzip_compressed(path)? {
        error!(?path, "Metadata is not gzip compressed, ignoring it");
        return Ok(None);
    }

    match decode(BufReader::new(file)) {
        Ok(records) => {
            if let Some(records) = &records {
                info!(?path, items = records.len(), "Loaded metadata");
            }
            Ok(records)
        }
        Err(err) => {
            error!(?path, %err, "Failed to load metadata");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tempfile::{NamedTempFile, tempdir};

    use super::*;
    use crate::builder::bytes_to_id;
    use crate::names::{NameCache, NameResolver};

    struct Fixed;

    impl NameResolver for Fixed {
        fn user_name(&self, _uid: u32) -> Option<String> {
            Some("user".into())
        }
        fn group_name(&self, _gid: u32) -> Option<String> {
            None
        }
    }

    fn records(dir: &Path) -> Vec<FileRecord> {
        let names = NameCache::new(Fixed);
        ["one", "two"]
            .iter()
            .map(|name| {
                let path = dir.join(name);
                fs::write(&path, format!("content for {name}")).unwrap();
                let meta = fs::symlink_metadata(&path).unwrap();
                let mut record = FileRecord::new(name.to_string(), &meta, &names);
                record.cid = Some(bytes_to_id(format!("content for {name}").as_bytes()));
                record.stale = false;
                record
            })
            .collect()
    }

    #[test]
    fn test_is_gzip_compressed() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&GZIP_MAGIC).unwrap();
        temp.write_all(b"some data").unwrap();
        temp.flush().unwrap();
        assert!(is_gzip_compressed(temp.path()).unwrap());

        let mut temp2 = NamedTempFile::new().unwrap();
        temp2.write_all(b"not compressed").unwrap();
        temp2.flush().unwrap();
        assert!(!is_gzip_compressed(temp2.path()).unwrap());
    }

    #[test]
    fn test_encode_decode() {
        let dir = tempdir().unwrap();
        let records = records(dir.path());

        let bytes = encode(Vec::new(), &records).unwrap();
        assert_eq!(&bytes[..2], &GZIP_MAGIC);

        let decoded = decode(Cursor::new(bytes)).unwrap().unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_document_shape() {
        let dir = tempdir().unwrap();
        let records = records(dir.path());
        let bytes = encode(Vec::new(), &records).unwrap();

        let mut json = String::new();
        GzDecoder::new(&bytes[..]).read_to_string(&mut json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["version"], STORE_VERSION);
        assert_eq!(value["item"].as_array().unwrap().len(), 2);
        assert_eq!(value["item"][0]["uname"], "user");
    }

    #[test]
    fn test_foreign_versions_ignored() {
        let mut doc = serde_json::json!({ "version": "0", "item": [] });
        let gz = |doc: &serde_json::Value| {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            serde_json::to_writer(&mut enc, doc).unwrap();
            enc.finish().unwrap()
        };
        assert!(decode(Cursor::new(gz(&doc))).unwrap().is_none());

        let dir = tempdir().unwrap();
        let mut items: Vec<serde_json::Value> = records(dir.path())
            .iter()
            .map(|r| serde_json::to_value(r).unwrap())
            .collect();
        items[0]["version"] = "2".into();
        doc = serde_json::json!({ "version": STORE_VERSION, "item": items });

        let decoded = decode(Cursor::new(gz(&doc))).unwrap().unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].path, "two");
    }

    #[test]
    fn test_save_load_with_backup() {
        let dir = tempdir().unwrap();
        let records = records(dir.path());
        let meta = dir.path().join(".cas");

        save(&meta, &records).unwrap();
        assert!(!backup_path(&meta).exists());
        assert_eq!(load(&meta).unwrap().unwrap(), records);

        save(&meta, &records[..1]).unwrap();
        assert!(backup_path(&meta).exists());
        assert_eq!(load(&meta).unwrap().unwrap().len(), 1);
        assert_eq!(load(&backup_path(&meta)).unwrap().unwrap().len(), 2);

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_missing_and_corrupt_are_absent() {
        let dir = tempdir().unwrap();
        let meta = dir.path().join(".cas");
        assert!(load(&meta).unwrap().is_none());

        fs::write(&meta, b"plain text").unwrap();
        assert!(load(&meta).unwrap().is_none());

        fs::write(&meta, [0x1f, 0x8b, 0, 1, 2, 3]).unwrap();
        assert!(load(&meta).unwrap().is_none());
    }
}
