use super::{
    OverlayIndex, OverlayRecord, BUNDLE_FORMAT_VERSION, METADATA_ENTRY, METADATA_REGION_SIZE,
    OVERLAY_INDEX_FILE, VERSION_ENTRY,
};
use crate::checksum::{is_hex_64, sha256_reader};
use crate::error::{BundleError, BundleResult, IoContext};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read access to a finished bundle.
///
/// Opening reads only the version and metadata entries; overlay bytes are
/// read on demand by seeking to the offsets recorded in `overlays.json`.
#[derive(Debug)]
pub struct BundleReader {
    path: PathBuf,
    version: u32,
    index: OverlayIndex,
    metadata: BTreeMap<String, Vec<u8>>,
}

impl BundleReader {
    pub fn open(path: impl Into<PathBuf>) -> BundleResult<Self> {
        let path = path.into();
        let file = File::open(&path)
            .io_context(|| format!("Failed to open bundle {}", path.display()))?;
        let file_len = file
            .metadata()
            .io_context(|| format!("Failed to stat bundle {}", path.display()))?
            .len();

        let ctx = || format!("Failed to read bundle {}", path.display());
        let mut archive = tar::Archive::new(file);
        let mut entries = archive.entries().io_context(ctx)?;

        let mut version_entry = entries
            .next()
            .ok_or_else(|| invalid(&path, "bundle is empty"))?
            .io_context(ctx)?;
        expect_name(&path, &version_entry, VERSION_ENTRY)?;
        let mut version = String::new();
        version_entry.read_to_string(&mut version).io_context(ctx)?;
        let version: u32 = version
            .trim()
            .parse()
            .map_err(|_| invalid(&path, &format!("unreadable version '{}'", version.trim())))?;
        if version != BUNDLE_FORMAT_VERSION {
            return Err(invalid(
                &path,
                &format!("unsupported bundle version {version}"),
            ));
        }
        drop(version_entry);

        let mut metadata_entry = entries
            .next()
            .ok_or_else(|| invalid(&path, "missing metadata entry"))?
            .io_context(ctx)?;
        expect_name(&path, &metadata_entry, METADATA_ENTRY)?;
        let mut compressed = vec![];
        metadata_entry.read_to_end(&mut compressed).io_context(ctx)?;
        drop(metadata_entry);

        let mut index = None;
        let mut metadata = BTreeMap::new();
        let mut inner = tar::Archive::new(GzDecoder::new(compressed.as_slice()));
        for entry in inner.entries().io_context(ctx)? {
            let mut entry = entry.io_context(ctx)?;
            let name = entry.path().io_context(ctx)?.to_string_lossy().into_owned();
            let mut bytes = vec![];
            entry.read_to_end(&mut bytes).io_context(ctx)?;
            if name == OVERLAY_INDEX_FILE {
                let parsed: OverlayIndex =
                    serde_json::from_slice(&bytes).map_err(|source| BundleError::Json {
                        context: format!("Failed to parse {OVERLAY_INDEX_FILE} in {}", path.display()),
                        source,
                    })?;
                index = Some(parsed);
            } else {
                metadata.insert(name, bytes);
            }
        }
        let index = index.ok_or_else(|| invalid(&path, "metadata has no overlays.json"))?;
        validate_index(&path, &index, file_len)?;
        debug!(
            "Opened bundle {} with {} overlay(s)",
            path.display(),
            index.overlays.len()
        );

        Ok(Self {
            path,
            version,
            index,
            metadata,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn overlays(&self) -> &[OverlayRecord] {
        &self.index.overlays
    }

    /// Contents of a caller-supplied metadata file, by file name.
    pub fn metadata_file(&self, name: &str) -> Option<&[u8]> {
        self.metadata.get(name).map(Vec::as_slice)
    }

    pub fn metadata_names(&self) -> impl Iterator<Item = &str> {
        self.metadata.keys().map(String::as_str)
    }

    /// Copy the raw bytes of overlay `name` into `out`, verifying its
    /// checksum. Bytes already written are not retracted on mismatch.
    pub fn copy_overlay<W: Write>(&self, name: &str, out: &mut W) -> BundleResult<u64> {
        let record = self.record(name)?;
        let ctx = || format!("Failed to read overlay '{name}' from {}", self.path.display());
        let mut file = File::open(&self.path).io_context(ctx)?;
        file.seek(SeekFrom::Start(record.offset)).io_context(ctx)?;

        let mut hashing = HashingWriter {
            inner: out,
            hasher: Sha256::new(),
        };
        let copied = io::copy(&mut file.take(record.size), &mut hashing).io_context(ctx)?;
        if copied != record.size {
            return Err(invalid(
                &self.path,
                &format!("overlay '{name}' is truncated ({copied} of {} bytes)", record.size),
            ));
        }
        let digest = format!("{:x}", hashing.hasher.finalize());
        if digest != record.sha256 {
            return Err(invalid(
                &self.path,
                &format!("overlay '{name}' checksum mismatch"),
            ));
        }
        Ok(copied)
    }

    /// Check every overlay against its recorded checksum.
    pub fn verify(&self) -> BundleResult<()> {
        for record in &self.index.overlays {
            let ctx = || format!("Failed to read overlay '{}'", record.name);
            let mut file = File::open(&self.path).io_context(ctx)?;
            file.seek(SeekFrom::Start(record.offset)).io_context(ctx)?;
            let digest = sha256_reader(file.take(record.size)).io_context(ctx)?;
            if digest != record.sha256 {
                return Err(invalid(
                    &self.path,
                    &format!("overlay '{}' checksum mismatch", record.name),
                ));
            }
        }
        Ok(())
    }

    /// Extract overlay `name` (a tar.gz) into `dest` after verifying it.
    ///
    /// The overlay is read twice, once to check its checksum and once to
    /// unpack it, so it is never held in memory.
    pub fn unpack_overlay(&self, name: &str, dest: &Path) -> BundleResult<()> {
        let record = self.record(name)?;
        self.copy_overlay(name, &mut io::sink())?;

        let ctx = || format!("Failed to read overlay '{name}' from {}", self.path.display());
        let mut file = File::open(&self.path).io_context(ctx)?;
        file.seek(SeekFrom::Start(record.offset)).io_context(ctx)?;
        fs::create_dir_all(dest)
            .io_context(|| format!("Failed to create directory: {}", dest.display()))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file.take(record.size)));
        archive
            .unpack(dest)
            .io_context(|| format!("Failed to unpack overlay '{name}' into {}", dest.display()))
    }

    fn record(&self, name: &str) -> BundleResult<&OverlayRecord> {
        self.index
            .get(name)
            .ok_or_else(|| invalid(&self.path, &format!("no overlay named '{name}'")))
    }
}

struct HashingWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn invalid(path: &Path, reason: &str) -> BundleError {
    BundleError::InvalidBundle {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn expect_name<R: Read>(path: &Path, entry: &tar::Entry<'_, R>, expected: &str) -> BundleResult<()> {
    let name = entry
        .path()
        .io_context(|| format!("Failed to read entry name in {}", path.display()))?;
    if name.as_os_str() != expected {
        return Err(invalid(
            path,
            &format!("expected '{expected}' entry, found '{}'", name.display()),
        ));
    }
    Ok(())
}

fn validate_index(path: &Path, index: &OverlayIndex, file_len: u64) -> BundleResult<()> {
    let mut previous_end = METADATA_REGION_SIZE;
    for record in &index.overlays {
        if !is_hex_64(&record.sha256) {
            return Err(invalid(
                path,
                &format!("overlay '{}' has a malformed checksum", record.name),
            ));
        }
        if record.offset < previous_end {
            return Err(invalid(
                path,
                &format!(
                    "overlay '{}' at offset {} overlaps the metadata region or a previous overlay",
                    record.name, record.offset
                ),
            ));
        }
        let end = record.offset.checked_add(record.size).unwrap_or(u64::MAX);
        if end > file_len {
            return Err(invalid(
                path,
                &format!("overlay '{}' extends past end of file", record.name),
            ));
        }
        previous_end = end;
    }
    Ok(())
}
