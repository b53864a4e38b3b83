//! Tar and tar.gz builders for overlays and legacy archives.
//!
//! Archives are deterministic: entries are sorted, owners and mtimes are
//! zeroed, so rebuilding an unchanged directory yields identical bytes.
//! Every output is written to a sibling temp file and renamed into place.

pub mod filesystem;

use crate::error::{BundleResult, IoContext};
use filesystem::{atomic_rename, sibling_tmp_path};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tar::{Builder as TarBuilder, EntryType, Header};
use walkdir::WalkDir;

/// gzip level for overlays and the legacy archive.
pub const GZIP_LEVEL: u32 = 5;

/// Archive every entry below `src_dir` into an uncompressed tar at
/// `out_path`. Children of `src_dir` become archive roots.
pub fn create_tar(src_dir: &Path, out_path: &Path) -> BundleResult<()> {
    publish(out_path, |tmp| {
        let out = File::create(tmp)?;
        let mut builder = TarBuilder::new(out);
        append_dir_contents(&mut builder, src_dir)?;
        builder.into_inner()?.flush()
    })
    .io_context(|| format!("Failed to create tar of {}", src_dir.display()))
}

/// Same as [`create_tar`], gzip-compressed.
pub fn create_tar_gz(src_dir: &Path, out_path: &Path) -> BundleResult<()> {
    publish(out_path, |tmp| {
        let out = File::create(tmp)?;
        let encoder = GzEncoder::new(out, Compression::new(GZIP_LEVEL));
        let mut builder = TarBuilder::new(encoder);
        append_dir_contents(&mut builder, src_dir)?;
        builder.into_inner()?.finish()?.flush()
    })
    .io_context(|| format!("Failed to create tar.gz of {}", src_dir.display()))
}

/// Archive individual files under explicit archive names.
pub fn create_tar_of_files(
    out_path: &Path,
    files: &[(PathBuf, String)],
    gzip: bool,
) -> BundleResult<()> {
    publish(out_path, |tmp| {
        let out = File::create(tmp)?;
        if gzip {
            let encoder = GzEncoder::new(out, Compression::new(GZIP_LEVEL));
            let mut builder = TarBuilder::new(encoder);
            for (src, name) in files {
                append_file(&mut builder, src, name)?;
            }
            builder.into_inner()?.finish()?.flush()
        } else {
            let mut builder = TarBuilder::new(out);
            for (src, name) in files {
                append_file(&mut builder, src, name)?;
            }
            builder.into_inner()?.flush()
        }
    })
    .io_context(|| format!("Failed to create archive {}", out_path.display()))
}

/// Run `write` against a temp path and rename the result to `out_path`.
/// The temp file is removed when `write` fails.
fn publish<F>(out_path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let tmp = sibling_tmp_path(out_path);
    if let Err(e) = write(&tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    atomic_rename(&tmp, out_path).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

/// Header with zeroed owner and mtime.
pub(crate) fn deterministic_header(entry_type: EntryType, size: u64, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(mode);
    header
}

#[cfg(unix)]
fn mode_of(md: &fs::Metadata, _fallback: u32) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(_md: &fs::Metadata, fallback: u32) -> u32 {
    fallback
}

/// Append a single regular file under `arcname`.
pub(crate) fn append_file<W: Write>(
    builder: &mut TarBuilder<W>,
    src: &Path,
    arcname: &str,
) -> io::Result<()> {
    let md = fs::metadata(src)?;
    let mut f = File::open(src)?;
    let mut header = deterministic_header(EntryType::Regular, md.len(), mode_of(&md, 0o644));
    builder.append_data(&mut header, arcname, &mut f)
}

/// Append everything below `src_dir`, sorted by relative path.
pub(crate) fn append_dir_contents<W: Write>(
    builder: &mut TarBuilder<W>,
    src_dir: &Path,
) -> io::Result<()> {
    let mut entries: Vec<PathBuf> = vec![];
    for ent in WalkDir::new(src_dir).follow_links(false) {
        let ent = ent?;
        let p = ent.path();
        if p == src_dir {
            continue;
        }
        entries.push(p.to_path_buf());
    }

    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy();
        ra.cmp(&rb)
    });

    for p in entries {
        let rel = p
            .strip_prefix(src_dir)
            .unwrap_or(&p)
            .to_string_lossy()
            .replace('\\', "/");

        let md = fs::symlink_metadata(&p)?;
        if md.is_dir() {
            let mut header = deterministic_header(EntryType::Directory, 0, mode_of(&md, 0o755));
            builder.append_data(&mut header, rel, io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&p)?;
            let mut header = deterministic_header(EntryType::Symlink, 0, mode_of(&md, 0o777));
            builder.append_link(&mut header, rel, target)?;
        } else if md.is_file() {
            let mut f = File::open(&p)?;
            let mut header =
                deterministic_header(EntryType::Regular, md.len(), mode_of(&md, 0o644));
            builder.append_data(&mut header, rel, &mut f)?;
        }
    }
    Ok(())
}
