use super::{
    entry_header_len, padded_len, plan_overlay_records, OverlayIndex, OverlayRecord, OverlaySource,
    BUNDLE_FORMAT_VERSION, METADATA_ENTRY, METADATA_REGION_SIZE, OVERLAY_INDEX_FILE, PAD_ENTRY,
    TAR_BLOCK_SIZE, VERSION_ENTRY,
};
use crate::artifact::filesystem::{atomic_rename, sibling_tmp_path};
use crate::artifact::{append_file, deterministic_header, GZIP_LEVEL};
use crate::checksum::sha256_file;
use crate::error::{BundleError, BundleResult, IoContext};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tar::{Builder as TarBuilder, EntryType};
use tracing::{debug, info, warn};

/// Writes a bundle file.
///
/// Metadata files and overlays are only registered by `add_*`; nothing is
/// read or written until [`close`](Self::close). The bundle is assembled in a
/// sibling temp file and renamed onto the output path once complete, so a
/// failed close never leaves a truncated bundle behind.
///
/// Dropping an open writer closes it; errors on that path can only be
/// logged, so callers that care about the result call `close` explicitly.
#[derive(Debug)]
pub struct BundleWriter {
    path: PathBuf,
    state: WriterState,
}

#[derive(Debug)]
enum WriterState {
    Open {
        /// Source file and name inside the metadata archive.
        metadata: Vec<(PathBuf, String)>,
        overlays: Vec<PathBuf>,
    },
    Closed,
}

impl BundleWriter {
    /// Start a bundle that will be written to `path` on close.
    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: WriterState::Open {
                metadata: vec![],
                overlays: vec![],
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, WriterState::Closed)
    }

    /// Register a file to be stored in the metadata archive under its file
    /// name.
    pub fn add_metadata(&mut self, path: impl Into<PathBuf>) -> BundleResult<()> {
        let path = path.into();
        let name = file_name_of(&path)?;
        self.add_metadata_as(path, name)
    }

    /// Register a file to be stored in the metadata archive as `name`.
    pub fn add_metadata_as(
        &mut self,
        path: impl Into<PathBuf>,
        name: impl Into<String>,
    ) -> BundleResult<()> {
        match &mut self.state {
            WriterState::Open { metadata, .. } => {
                metadata.push((path.into(), name.into()));
                Ok(())
            }
            WriterState::Closed => Err(self.closed_error()),
        }
    }

    /// Register an already-built archive to be appended as an overlay.
    pub fn add_overlay_archive(&mut self, path: impl Into<PathBuf>) -> BundleResult<()> {
        match &mut self.state {
            WriterState::Open { overlays, .. } => {
                overlays.push(path.into());
                Ok(())
            }
            WriterState::Closed => Err(self.closed_error()),
        }
    }

    /// Write the bundle. Calling `close` on a closed writer is a no-op.
    ///
    /// The writer is closed afterwards even when writing fails.
    pub fn close(&mut self) -> BundleResult<()> {
        let (metadata, overlays) = match std::mem::replace(&mut self.state, WriterState::Closed) {
            WriterState::Closed => return Ok(()),
            WriterState::Open { metadata, overlays } => (metadata, overlays),
        };

        debug!("Start: Bundle {}", self.path.display());
        let tmp = sibling_tmp_path(&self.path);
        if let Err(e) = write_bundle(&tmp, &metadata, &overlays) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        atomic_rename(&tmp, &self.path)?;
        debug!("End: Bundle {}", self.path.display());
        Ok(())
    }

    /// Fail early with [`BundleError::MetadataTooLarge`] when the registered
    /// metadata cannot fit the metadata region. See [`check_metadata_size`].
    pub fn check_metadata_size(&self) -> BundleResult<()> {
        match &self.state {
            WriterState::Open { metadata, overlays } => check_metadata_size(metadata, overlays),
            WriterState::Closed => Err(self.closed_error()),
        }
    }

    fn closed_error(&self) -> BundleError {
        BundleError::InvalidState(format!(
            "bundle writer for '{}' is closed",
            self.path.display()
        ))
    }
}

impl Drop for BundleWriter {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.close() {
            warn!("Failed to finalize bundle {}: {e}", self.path.display());
        }
    }
}

/// Check that `metadata` (source file, name in the bundle) fits the
/// metadata region of a bundle holding `overlays`.
///
/// Only metadata files are read, so this can run before the overlays exist.
/// Their index entries are estimated with a block of headroom; `close` still
/// checks the exact size.
pub fn check_metadata_size(
    metadata: &[(PathBuf, String)],
    overlays: &[PathBuf],
) -> BundleResult<()> {
    let mut sources = Vec::with_capacity(overlays.len());
    for overlay in overlays {
        sources.push(OverlaySource {
            name: file_name_of(overlay)?,
            size: 0,
            sha256: "0".repeat(64),
        });
    }
    let archive = build_metadata_archive(&plan_overlay_records(&sources), metadata)?;
    let limit = METADATA_REGION_SIZE - TAR_BLOCK_SIZE;
    let estimate = archive.len() as u64 + TAR_BLOCK_SIZE;
    if estimate > limit {
        return Err(BundleError::MetadataTooLarge {
            size: estimate,
            limit,
        });
    }
    debug!("Metadata estimate {estimate} bytes fits in {limit}");
    Ok(())
}

fn file_name_of(path: &Path) -> BundleResult<String> {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| BundleError::InvalidState(format!("'{}' has no file name", path.display())))
}

fn write_bundle(
    out_path: &Path,
    metadata: &[(PathBuf, String)],
    overlays: &[PathBuf],
) -> BundleResult<()> {
    debug!("Start: metadata");
    let mut sources = Vec::with_capacity(overlays.len());
    let mut names = BTreeSet::new();
    for overlay in overlays {
        let name = file_name_of(overlay)?;
        if !names.insert(name.clone()) {
            return Err(BundleError::InvalidState(format!(
                "overlay name '{name}' registered twice"
            )));
        }
        let size = fs::metadata(overlay)
            .io_context(|| format!("Failed to stat overlay {}", overlay.display()))?
            .len();
        let sha256 = sha256_file(overlay)?;
        sources.push(OverlaySource { name, size, sha256 });
    }
    let records = plan_overlay_records(&sources);

    let metadata_archive = build_metadata_archive(&records, metadata)?;
    let limit = METADATA_REGION_SIZE - TAR_BLOCK_SIZE;
    if metadata_archive.len() as u64 > limit {
        return Err(BundleError::MetadataTooLarge {
            size: metadata_archive.len() as u64,
            limit,
        });
    }
    debug!("End: metadata ({} bytes)", metadata_archive.len());

    let out = File::create(out_path)
        .io_context(|| format!("Failed to create bundle {}", out_path.display()))?;
    let mut builder = TarBuilder::new(out);
    let ctx = || format!("Failed to write bundle {}", out_path.display());

    let version = BUNDLE_FORMAT_VERSION.to_string();
    let mut header = deterministic_header(EntryType::Regular, version.len() as u64, 0o644);
    builder
        .append_data(&mut header, VERSION_ENTRY, version.as_bytes())
        .io_context(ctx)?;

    let mut header =
        deterministic_header(EntryType::Regular, metadata_archive.len() as u64, 0o644);
    builder
        .append_data(&mut header, METADATA_ENTRY, metadata_archive.as_slice())
        .io_context(ctx)?;

    debug!("Start: pad");
    let position = builder.get_mut().stream_position().io_context(ctx)?;
    let pad_header = entry_header_len(PAD_ENTRY);
    if position + pad_header > METADATA_REGION_SIZE {
        return Err(BundleError::MetadataTooLarge {
            size: metadata_archive.len() as u64,
            limit,
        });
    }
    let pad_size = METADATA_REGION_SIZE - position - pad_header;
    let mut header = deterministic_header(EntryType::Regular, pad_size, 0o644);
    builder
        .append_data(&mut header, PAD_ENTRY, io::repeat(0).take(pad_size))
        .io_context(ctx)?;
    debug!("End: pad ({pad_size} bytes)");

    for (path, record) in overlays.iter().zip(&records) {
        info!("Start tar overlay file: {}", path.display());
        let position = builder.get_mut().stream_position().io_context(ctx)?;
        let header_len = entry_header_len(&record.name);
        if position + header_len != record.offset {
            return Err(BundleError::InvalidState(format!(
                "overlay '{}' would start at {} but the index records {}",
                record.name,
                position + header_len,
                record.offset
            )));
        }
        append_overlay(&mut builder, path, record)?;
        info!("End tar overlay file: {}", path.display());
    }

    let mut out = builder.into_inner().io_context(ctx)?;
    out.flush().io_context(ctx)?;
    out.sync_all().io_context(ctx)?;
    Ok(())
}

fn append_overlay(
    builder: &mut TarBuilder<File>,
    path: &Path,
    record: &OverlayRecord,
) -> BundleResult<()> {
    let ctx = || format!("Failed to append overlay {}", path.display());
    let f = File::open(path).io_context(|| format!("Failed to open overlay {}", path.display()))?;
    // Never copy more than was checksummed.
    let mut header = deterministic_header(EntryType::Regular, record.size, 0o644);
    builder
        .append_data(&mut header, &record.name, f.take(record.size))
        .io_context(ctx)?;

    let end = builder.get_mut().stream_position().io_context(ctx)?;
    if end != record.offset + padded_len(record.size) {
        return Err(BundleError::InvalidState(format!(
            "overlay '{}' changed size while the bundle was written",
            record.name
        )));
    }
    Ok(())
}

/// gzip tar holding `overlays.json` followed by each metadata file.
fn build_metadata_archive(
    records: &[OverlayRecord],
    metadata: &[(PathBuf, String)],
) -> BundleResult<Vec<u8>> {
    let index = OverlayIndex {
        overlays: records.to_vec(),
    };
    let index_json = serde_json::to_vec(&index).map_err(|source| BundleError::Json {
        context: format!("Failed to encode {OVERLAY_INDEX_FILE}"),
        source,
    })?;

    let ctx = || "Failed to build metadata archive".to_string();
    let encoder = GzEncoder::new(Vec::new(), Compression::new(GZIP_LEVEL));
    let mut builder = TarBuilder::new(encoder);
    let mut header = deterministic_header(EntryType::Regular, index_json.len() as u64, 0o644);
    builder
        .append_data(&mut header, OVERLAY_INDEX_FILE, index_json.as_slice())
        .io_context(ctx)?;

    let mut names = BTreeSet::from([OVERLAY_INDEX_FILE.to_string()]);
    for (path, name) in metadata {
        if !names.insert(name.clone()) {
            return Err(BundleError::InvalidState(format!(
                "metadata file name '{name}' is already used in the bundle"
            )));
        }
        append_file(&mut builder, path, name)
            .io_context(|| format!("Failed to add metadata file {}", path.display()))?;
    }

    let encoder = builder.into_inner().io_context(ctx)?;
    encoder.finish().io_context(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::sha256_file;
    use flate2::read::GzDecoder;
    use std::io::SeekFrom;
    use tempfile::TempDir;

    fn make_overlay(dir: &Path, name: &str, payload: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let mut builder = TarBuilder::new(encoder);
        let mut header = deterministic_header(EntryType::Regular, payload.len() as u64, 0o644);
        builder.append_data(&mut header, "file", payload).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    fn read_range(path: &Path, offset: u64, size: u64) -> Vec<u8> {
        let mut f = File::open(path).unwrap();
        f.seek(SeekFrom::Start(offset)).unwrap();
        let mut buf = vec![0u8; size as usize];
        f.read_exact(&mut buf).unwrap();
        buf
    }

    /// Deterministic bytes that gzip cannot shrink.
    fn incompressible(len: usize) -> Vec<u8> {
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    fn read_index(bundle: &Path, tmp: &Path) -> OverlayIndex {
        let mut archive = tar::Archive::new(File::open(bundle).unwrap());
        let mut entries = archive.entries().unwrap();
        entries.next().unwrap().unwrap();
        let mut metadata = entries.next().unwrap().unwrap();
        let mut bytes = vec![];
        metadata.read_to_end(&mut bytes).unwrap();
        let mut inner = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        inner.unpack(tmp.join("metadata")).unwrap();
        let json = fs::read(tmp.join("metadata").join(OVERLAY_INDEX_FILE)).unwrap();
        serde_json::from_slice(&json).unwrap()
    }

    #[test]
    fn bundle_layout_matches_format() {
        let tmp = TempDir::new().unwrap();
        let deps = make_overlay(tmp.path(), "dependencies.tar.gz", b"deps");
        let ws = make_overlay(tmp.path(), "workspace.tar.gz", b"workspace");
        let installers = tmp.path().join("installer_metadata.json");
        fs::write(&installers, br#"{"pip3":{}}"#).unwrap();
        let out = tmp.path().join("output.tar");

        let mut writer = BundleWriter::create(&out);
        writer.add_metadata(&installers).unwrap();
        writer.add_overlay_archive(&deps).unwrap();
        writer.add_overlay_archive(&ws).unwrap();
        writer.close().unwrap();

        let mut archive = tar::Archive::new(File::open(&out).unwrap());
        let mut members = vec![];
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            members.push((
                entry.path().unwrap().to_string_lossy().into_owned(),
                entry.raw_header_position(),
                entry.raw_file_position(),
            ));
        }
        let names: Vec<&str> = members.iter().map(|m| m.0.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "version",
                "metadata.tar.gz",
                "pad",
                "dependencies.tar.gz",
                "workspace.tar.gz"
            ]
        );
        assert_eq!(members[3].1, METADATA_REGION_SIZE);

        let index = read_index(&out, tmp.path());
        assert_eq!(index.overlays.len(), 2);
        for (record, member) in index.overlays.iter().zip(&members[3..]) {
            assert_eq!(record.offset, member.2);
        }
        for (record, original) in index.overlays.iter().zip([&deps, &ws]) {
            let bytes = read_range(&out, record.offset, record.size);
            assert_eq!(bytes, fs::read(original).unwrap());
            assert_eq!(record.sha256, sha256_file(original).unwrap());
        }
        assert!(tmp.path().join("metadata/installer_metadata.json").is_file());
    }

    #[test]
    fn long_overlay_names_keep_offsets_exact() {
        let tmp = TempDir::new().unwrap();
        let name = format!("{}.tar.gz", "long".repeat(40));
        let first = make_overlay(tmp.path(), &name, b"first");
        let second = make_overlay(tmp.path(), "second.tar.gz", b"second");
        let out = tmp.path().join("output.tar");

        let mut writer = BundleWriter::create(&out);
        writer.add_overlay_archive(&first).unwrap();
        writer.add_overlay_archive(&second).unwrap();
        writer.close().unwrap();

        let index = read_index(&out, tmp.path());
        assert_eq!(index.overlays[0].name, name);
        for (record, original) in index.overlays.iter().zip([&first, &second]) {
            assert_eq!(
                read_range(&out, record.offset, record.size),
                fs::read(original).unwrap()
            );
        }
    }

    #[test]
    fn oversized_metadata_is_rejected_without_output() {
        let tmp = TempDir::new().unwrap();
        let big = tmp.path().join("packages.json");
        fs::write(&big, incompressible(METADATA_REGION_SIZE as usize + 1024)).unwrap();
        let overlay = make_overlay(tmp.path(), "dependencies.tar.gz", b"deps");
        let out = tmp.path().join("output.tar");

        let mut writer = BundleWriter::create(&out);
        writer.add_metadata(&big).unwrap();
        writer.add_overlay_archive(&overlay).unwrap();
        let err = writer.close().unwrap_err();

        assert!(matches!(err, BundleError::MetadataTooLarge { .. }));
        assert!(!out.exists());
        let partials = fs::read_dir(tmp.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".partial")
            })
            .count();
        assert_eq!(partials, 0);
    }

    #[test]
    fn metadata_close_to_the_limit_still_fits() {
        let tmp = TempDir::new().unwrap();
        let meta = tmp.path().join("packages.json");
        fs::write(&meta, incompressible(3 * 1024 * 1024)).unwrap();
        let overlay = make_overlay(tmp.path(), "dependencies.tar.gz", b"deps");
        let out = tmp.path().join("output.tar");

        let mut writer = BundleWriter::create(&out);
        writer.add_metadata(&meta).unwrap();
        writer.add_overlay_archive(&overlay).unwrap();
        writer.close().unwrap();

        let index = read_index(&out, tmp.path());
        assert_eq!(index.overlays[0].offset, METADATA_REGION_SIZE + TAR_BLOCK_SIZE);
    }

    #[test]
    fn oversized_metadata_is_caught_before_overlays_exist() {
        let tmp = TempDir::new().unwrap();
        let big = tmp.path().join("packages.json");
        fs::write(&big, incompressible(METADATA_REGION_SIZE as usize)).unwrap();
        let small = tmp.path().join("small.json");
        fs::write(&small, b"{}").unwrap();

        let mut writer = BundleWriter::create(tmp.path().join("output.tar"));
        writer.add_metadata(&small).unwrap();
        writer
            .add_overlay_archive(tmp.path().join("not-built-yet.tar.gz"))
            .unwrap();
        writer.check_metadata_size().unwrap();

        writer.add_metadata(&big).unwrap();
        assert!(matches!(
            writer.check_metadata_size(),
            Err(BundleError::MetadataTooLarge { .. })
        ));
    }

    #[test]
    fn metadata_can_be_stored_under_another_name() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("pending.json");
        fs::write(&source, b"{}").unwrap();
        let overlay = make_overlay(tmp.path(), "dependencies.tar.gz", b"deps");
        let out = tmp.path().join("output.tar");

        let mut writer = BundleWriter::create(&out);
        writer.add_metadata_as(&source, "installer_metadata.json").unwrap();
        writer.add_overlay_archive(&overlay).unwrap();
        writer.close().unwrap();

        read_index(&out, tmp.path());
        let metadata = tmp.path().join("metadata");
        assert!(metadata.join("installer_metadata.json").is_file());
        assert!(!metadata.join("pending.json").exists());
    }

    #[test]
    fn closed_writer_rejects_registration_and_close_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("output.tar");
        let mut writer = BundleWriter::create(&out);
        writer.close().unwrap();
        assert!(writer.is_closed());
        let before = fs::read(&out).unwrap();

        assert!(matches!(
            writer.add_metadata(tmp.path().join("x.json")),
            Err(BundleError::InvalidState(_))
        ));
        assert!(matches!(
            writer.add_overlay_archive(tmp.path().join("x.tar.gz")),
            Err(BundleError::InvalidState(_))
        ));
        writer.close().unwrap();
        assert_eq!(fs::read(&out).unwrap(), before);
    }

    #[test]
    fn drop_finalizes_open_writer() {
        let tmp = TempDir::new().unwrap();
        let overlay = make_overlay(tmp.path(), "dependencies.tar.gz", b"deps");
        let out = tmp.path().join("output.tar");
        {
            let mut writer = BundleWriter::create(&out);
            writer.add_overlay_archive(&overlay).unwrap();
        }
        let index = read_index(&out, tmp.path());
        assert_eq!(index.overlays.len(), 1);
    }

    #[test]
    fn duplicate_overlay_names_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let overlay = make_overlay(tmp.path(), "dependencies.tar.gz", b"deps");
        let mut writer = BundleWriter::create(tmp.path().join("output.tar"));
        writer.add_overlay_archive(&overlay).unwrap();
        writer.add_overlay_archive(&overlay).unwrap();
        assert!(matches!(writer.close(), Err(BundleError::InvalidState(_))));
    }
}
