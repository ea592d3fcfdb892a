//! The script phase contract (component C6): the operations a phase
//! function may invoke, and the declared-dependency/phase-ordering
//! validation those operations enforce (spec §4.6).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::archive;
use crate::error::{Error, Result};
use crate::hash::sha256;
use crate::options::OptionValue;
use crate::package::Package;
use crate::phase::Phase;
use crate::recipe::FetchItem;
use crate::shell::{self, RunOptions, RunOutcome, Shell};

/// Downloads a source into a destination file. Local paths and, under the
/// `net` feature, http(s) URLs. Remote transport adapters beyond this are
/// out of scope (spec §1) — a host embedding this crate may supply a
/// richer implementation by constructing its own `PhaseContext` with a
/// different `Transport`.
pub trait Transport: Send + Sync {
    fn fetch_to(&self, source: &str, dest_file: &Path) -> Result<()>;
}

pub struct LocalTransport;

impl Transport for LocalTransport {
    fn fetch_to(&self, source: &str, dest_file: &Path) -> Result<()> {
        if let Some(path) = source.strip_prefix("file://") {
            fs::copy(path, dest_file)?;
            return Ok(());
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            return self.fetch_http(source, dest_file);
        }
        // Bare path: treat as local.
        fs::copy(source, dest_file)?;
        Ok(())
    }
}

impl LocalTransport {
    #[cfg(feature = "net")]
    fn fetch_http(&self, source: &str, dest_file: &Path) -> Result<()> {
        let response = reqwest::blocking::get(source).map_err(|e| Error::PhaseScriptFailure {
            identity: String::new(),
            phase: "fetch".into(),
            reason: format!("http fetch of {source} failed: {e}"),
            file: None,
            provenance: vec![],
        })?;
        let bytes = response.bytes().map_err(|e| Error::PhaseScriptFailure {
            identity: String::new(),
            phase: "fetch".into(),
            reason: format!("reading http response from {source} failed: {e}"),
            file: None,
            provenance: vec![],
        })?;
        fs::write(dest_file, bytes)?;
        Ok(())
    }

    #[cfg(not(feature = "net"))]
    fn fetch_http(&self, source: &str, _dest_file: &Path) -> Result<()> {
        Err(Error::PhaseScriptFailure {
            identity: String::new(),
            phase: "fetch".into(),
            reason: format!(
                "{source}: http(s) fetch requires the `net` feature, which is disabled"
            ),
            file: None,
            provenance: vec![],
        })
    }
}

/// Per-phase context handed to a phase function: the directories it may
/// touch, its options, and the operations of spec §4.6.
pub struct PhaseContext {
    pub phase: Phase,
    pub fetch_dir: PathBuf,
    pub stage_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub install_dir: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub options: OptionValue,
    pub env: HashMap<String, String>,
    pub default_shell: Option<Shell>,
    pub package: Arc<Package>,
    pub transport: Arc<dyn Transport>,
}

impl PhaseContext {
    /// `fetch(source_or_list, opts_dest)`: download into `dest` (defaults
    /// to `tmp_dir`), returning the chosen basename(s). Basenames
    /// collide-avoid by inserting `-2`, `-3`, ... before the final
    /// extension. No SHA-256 verification happens here; `commit_fetch`
    /// does that.
    pub fn fetch(&self, items: &[FetchItem], dest: Option<&Path>) -> Result<Vec<String>> {
        let dest_dir = dest.unwrap_or(&self.tmp_dir);
        fs::create_dir_all(dest_dir)?;
        let mut chosen = Vec::new();
        for item in items {
            let base = basename_of(&item.source);
            let unique = unique_basename(dest_dir, &base);
            let dest_file = dest_dir.join(&unique);
            debug!(source = %item.source, dest = %dest_file.display(), "fetching");
            self.transport.fetch_to(&item.source, &dest_file)?;
            chosen.push(unique);
        }
        Ok(chosen)
    }

    /// `commit_fetch(name_or_list)`: atomically move named files from
    /// `tmp/` into `fetch/`, verifying SHA-256 for any that declare one.
    /// On any verification failure or missing input the whole commit is
    /// rejected (nothing is moved).
    pub fn commit_fetch(&self, items: &[(String, Option<String>)]) -> Result<()> {
        fs::create_dir_all(&self.fetch_dir)?;
        for (name, expected_sha) in items {
            let src = self.tmp_dir.join(name);
            if !src.exists() {
                return Err(Error::LockBroken {
                    reason: format!("commit_fetch: {name} not found in tmp/"),
                });
            }
            if let Some(expected) = expected_sha {
                let actual = sha256(&fs::read(&src)?);
                if &actual != expected {
                    let _ = fs::remove_file(&src);
                    return Err(Error::HashMismatch {
                        path: src,
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
        }
        for (name, _) in items {
            let src = self.tmp_dir.join(name);
            let dst = self.fetch_dir.join(name);
            crate::fs_util::move_file_atomic(&src, &dst)?;
        }
        Ok(())
    }

    /// `verify_hash(path, sha256)`.
    pub fn verify_hash(&self, path: &Path, expected_sha256: &str) -> Result<bool> {
        let actual = sha256(&fs::read(path)?);
        Ok(actual == expected_sha256)
    }

    /// `extract(archive, dest, opts.strip)`: returns the extracted file
    /// count. A strip depth deeper than the archive yields zero files, not
    /// an error.
    pub fn extract(&self, archive_path: &Path, dest: &Path, strip: u32) -> Result<u64> {
        archive::extract(archive_path, dest, strip)
    }

    /// `extract_all(src_dir, dest_dir, opts)`: extract every archive found
    /// directly under `src_dir` into `dest_dir` with the same options.
    pub fn extract_all(&self, src_dir: &Path, dest_dir: &Path, strip: u32) -> Result<u64> {
        let mut total = 0;
        if !src_dir.exists() {
            return Ok(0);
        }
        for entry in fs::read_dir(src_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                total += self.extract(&entry.path(), dest_dir, strip)?;
            }
        }
        Ok(total)
    }

    /// `run(script, opts)`.
    pub fn run(&self, script: &str, opts: RunOptions) -> Result<RunOutcome> {
        let mut opts = opts;
        if opts.shell.is_none() {
            opts.shell = self.default_shell.clone();
        }
        shell::run(script, &self.work_dir, &opts)
    }

    /// `package(identity)`: the `pkg_path` of a declared dependency,
    /// fuzzy-matched, gated by phase ordering (spec §4.6).
    pub fn package(&self, identity: &str) -> Result<PathBuf> {
        let dep = self.find_strong_dependency(identity)?;
        self.check_ready(&dep)?;
        let kind = *dep.package.kind.lock().expect("poisoned");
        if kind == crate::package::PackageKind::UserManaged {
            return Err(Error::UndeclaredDependency {
                identity: identity.to_string(),
                from: format!("{}: user-managed dependency has no asset path", self.package.identity()),
            });
        }
        dep.package
            .pkg_path
            .lock()
            .expect("poisoned")
            .clone()
            .ok_or_else(|| Error::DependencyNotReady {
                identity: identity.to_string(),
                needed_by: dep.needed_by.to_string(),
                current: self.phase.to_string(),
            })
    }

    /// `product(name)`: the resolved product value for a declared product
    /// dependency.
    pub fn product(&self, name: &str) -> Result<String> {
        let product_deps = self.package.product_dependencies.lock().expect("poisoned");
        let info = product_deps
            .get(name)
            .ok_or_else(|| Error::UndeclaredDependency {
                identity: name.to_string(),
                from: self.package.identity().to_string(),
            })?
            .clone();
        drop(product_deps);

        if let Some(constraint) = &info.constraint_identity {
            if !info.provider.key.matches(constraint) {
                return Err(Error::UndeclaredDependency {
                    identity: name.to_string(),
                    from: format!("provider does not satisfy constraint {constraint}"),
                });
            }
        }
        let current = self.package.exec_ctx.current_phase().unwrap_or(self.phase);
        if current < required_phase_for(info.needed_by) {
            return Err(Error::DependencyNotReady {
                identity: name.to_string(),
                needed_by: info.needed_by.to_string(),
                current: current.to_string(),
            });
        }

        let kind = *info.provider.kind.lock().expect("poisoned");
        let products = info.provider.products.lock().expect("poisoned");
        let value = products
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UndeclaredDependency {
                identity: name.to_string(),
                from: info.provider.identity().to_string(),
            })?;
        if kind == crate::package::PackageKind::UserManaged {
            Ok(value)
        } else {
            let pkg_path = info
                .provider
                .pkg_path
                .lock()
                .expect("poisoned")
                .clone()
                .ok_or_else(|| Error::DependencyNotReady {
                    identity: name.to_string(),
                    needed_by: info.needed_by.to_string(),
                    current: current.to_string(),
                })?;
            Ok(pkg_path.join(value).to_string_lossy().into_owned())
        }
    }

    fn find_strong_dependency(&self, identity: &str) -> Result<crate::package::DependencyInfo> {
        let deps = self.package.dependencies.lock().expect("poisoned");
        deps.values()
            .find(|d| d.package.key.matches(identity))
            .cloned()
            .ok_or_else(|| Error::UndeclaredDependency {
                identity: identity.to_string(),
                from: self.package.identity().to_string(),
            })
    }

    fn check_ready(&self, dep: &crate::package::DependencyInfo) -> Result<()> {
        let current = self.package.exec_ctx.current_phase().unwrap_or(self.phase);
        if current < required_phase_for(dep.needed_by) {
            return Err(Error::DependencyNotReady {
                identity: dep.package.identity().to_string(),
                needed_by: dep.needed_by.to_string(),
                current: current.to_string(),
            });
        }
        Ok(())
    }

    /// `extend(target, ...sources)`: append every source list's items onto
    /// `target` in order.
    pub fn extend(target: &mut Vec<String>, sources: &[Vec<String>]) {
        for source in sources {
            target.extend(source.iter().cloned());
        }
    }

    /// `template(format_string, values)`: `%(name)s`-style substitution,
    /// matching the teacher's recipe templating convention.
    pub fn template(format_string: &str, values: &HashMap<String, String>) -> String {
        let mut out = format_string.to_string();
        for (key, value) in values {
            out = out.replace(&format!("%({key})s"), value);
        }
        out
    }

    pub fn log_trace(&self, msg: &str) {
        trace!(identity = self.package.identity(), "{msg}");
    }
    pub fn log_debug(&self, msg: &str) {
        debug!(identity = self.package.identity(), "{msg}");
    }
    pub fn log_info(&self, msg: &str) {
        info!(identity = self.package.identity(), "{msg}");
    }
    pub fn log_warn(&self, msg: &str) {
        warn!(identity = self.package.identity(), "{msg}");
    }
}

fn required_phase_for(needed_by: crate::phase::NeededBy) -> Phase {
    Phase::ALL
        .into_iter()
        .find(|p| needed_by.gates(*p))
        .unwrap_or(Phase::Completion)
}

fn basename_of(source: &str) -> String {
    source
        .rsplit('/')
        .next()
        .unwrap_or(source)
        .to_string()
}

/// Known multi-dot archive suffixes that must split as a whole, so
/// `archive.tar.gz` collides into `archive-2.tar.gz`, not `archive.tar-2.gz`.
const COMPOUND_SUFFIXES: &[&str] = &[".tar.gz", ".tar.xz", ".tar.bz2"];

/// Insert `-2`, `-3`, ... before the final extension when `base` already
/// exists in `dir` (spec §4.6: "before the final extension").
fn unique_basename(dir: &Path, base: &str) -> String {
    if !dir.join(base).exists() {
        return base.to_string();
    }
    let (stem, ext) = split_extension(base);
    let mut n = 2;
    loop {
        let candidate = format!("{stem}-{n}{ext}");
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        n += 1;
    }
}

fn split_extension(base: &str) -> (&str, &str) {
    for suffix in COMPOUND_SUFFIXES {
        if let Some(stem) = base.strip_suffix(suffix) {
            if !stem.is_empty() {
                return (stem, suffix);
            }
        }
    }
    match base.find('.') {
        Some(idx) if idx > 0 => (&base[..idx], &base[idx..]),
        _ => (base, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn unique_basename_inserts_before_extension() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("archive.tar.gz"), b"x").unwrap();
        let name = unique_basename(dir.path(), "archive.tar.gz");
        assert_eq!(name, "archive-2.tar.gz");
    }

    #[test]
    fn unique_basename_passthrough_when_free() {
        let dir = TempDir::new().unwrap();
        let name = unique_basename(dir.path(), "archive.tar.gz");
        assert_eq!(name, "archive.tar.gz");
    }

    #[test]
    fn template_substitutes_named_values() {
        let mut values = HashMap::new();
        values.insert("name".to_string(), "hello".to_string());
        values.insert("version".to_string(), "1.0".to_string());
        let out = PhaseContext::template("%(name)s-%(version)s.tar.gz", &values);
        assert_eq!(out, "hello-1.0.tar.gz");
    }

    #[test]
    fn local_transport_copies_files() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, b"hello").unwrap();
        let dst = dir.path().join("dst.txt");
        let transport = LocalTransport;
        transport.fetch_to(src.to_str().unwrap(), &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"hello");
    }
}
