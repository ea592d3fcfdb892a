//! Archive extraction (spec §4.6 `extract`/`extract_all`): tar, optionally
//! gzip- or xz-compressed. The default extractor adapter; a host may swap
//! in a different one at the `PhaseContext` construction boundary for
//! formats this crate does not natively decode (spec §1 out-of-scope
//! archive extractors beyond this baseline).

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tar::Archive;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
    Xz,
}

fn detect_compression(path: &Path) -> Compression {
    let name = path.to_string_lossy();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Compression::Gzip
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
        Compression::Xz
    } else {
        Compression::None
    }
}

/// Extract `archive_path` into `dest`, stripping `strip` leading path
/// components from every entry (components stripped past an entry's own
/// depth are simply skipped, not an error). Returns the number of files
/// written.
pub fn extract(archive_path: &Path, dest: &Path, strip: u32) -> Result<u64> {
    std::fs::create_dir_all(dest)?;
    let file = File::open(archive_path)?;
    let reader: Box<dyn Read> = match detect_compression(archive_path) {
        Compression::None => Box::new(file),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(file)),
    };
    extract_tar(reader, dest, strip)
}

fn extract_tar(reader: Box<dyn Read>, dest: &Path, strip: u32) -> Result<u64> {
    let mut archive = Archive::new(reader);
    let mut count = 0u64;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let stripped = strip_components(&path, strip);
        let Some(stripped) = stripped else { continue };
        if stripped.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&stripped);
        entry.unpack(&target).map_err(|e| Error::CacheCorruption {
            path: target.clone(),
            reason: format!("failed to extract {}: {e}", path.display()),
        })?;
        count += 1;
    }
    Ok(count)
}

fn strip_components(path: &Path, strip: u32) -> Option<PathBuf> {
    let mut components = path.components();
    for _ in 0..strip {
        components.next()?;
    }
    let rest: PathBuf = components.collect();
    Some(rest)
}
