//! Bundle resolution (component C8, spec §4.8): a named archive containing
//! multiple specs behind a single shared cache entry.
//!
//! On first request for any spec contained in a bundle, the bundle's
//! archive is fetched and extracted exactly once, addressed only by the
//! bundle identity (mirrors how `resolve_recipe_path` caches a lone fetched
//! recipe via `Cache::ensure_spec`). The manifest is then parsed, the
//! declared `BUNDLE` identity checked against the requested one, and every
//! `(identity, relpath)` pair validated in parallel by loading the spec
//! file (not executing its phases) and comparing its self-declared
//! identity to the map key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::cache::Cache;
use crate::contract::Transport;
use crate::descriptor::RecipeSource;
use crate::error::{Error, Result};
use crate::recipe::RecipeLoader;

/// Parsed `envy-bundle.lua` manifest (spec §6 "Bundle manifest").
pub struct BundleManifest {
    pub bundle_identity: String,
    pub specs: HashMap<String, PathBuf>,
}

impl BundleManifest {
    /// `BUNDLE` must be non-empty and equal the identity it was requested
    /// under; every `SPECS` value must be a non-empty, non-absolute,
    /// `..`-free relative path (spec §6).
    fn validate(&self, expected_identity: &str) -> Result<()> {
        if self.bundle_identity.is_empty() {
            return Err(Error::MalformedRecipe {
                path: None,
                reason: "bundle manifest BUNDLE must be non-empty".into(),
            });
        }
        if self.bundle_identity != expected_identity {
            return Err(Error::IdentityMismatch {
                declared: self.bundle_identity.clone(),
                expected: expected_identity.to_string(),
            });
        }
        for (identity, relpath) in &self.specs {
            if relpath.as_os_str().is_empty() {
                return Err(Error::MalformedRecipe {
                    path: None,
                    reason: format!(
                        "bundle {}: spec {identity} has an empty path",
                        self.bundle_identity
                    ),
                });
            }
            if relpath.is_absolute() {
                return Err(Error::MalformedRecipe {
                    path: None,
                    reason: format!(
                        "bundle {}: spec {identity} path {} must be relative",
                        self.bundle_identity,
                        relpath.display()
                    ),
                });
            }
            if relpath
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(Error::MalformedRecipe {
                    path: None,
                    reason: format!(
                        "bundle {}: spec {identity} path {} escapes the bundle root",
                        self.bundle_identity,
                        relpath.display()
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Loads and parses a bundle manifest file at a resolved path. The embedded
/// scripting runtime that would execute `envy-bundle.lua` is out of scope
/// here (spec §1); this is the seam a host fills in, mirroring `RecipeLoader`.
pub trait BundleManifestLoader: Send + Sync {
    fn load(&self, manifest_path: &Path) -> Result<BundleManifest>;
}

struct ResolvedBundle {
    root: PathBuf,
    manifest: BundleManifest,
}

/// Process-wide registry of resolved bundles, deduplicated by bundle
/// identity so concurrent requests for specs in the same bundle share one
/// fetch/extract/validate pass (spec §4.8).
pub struct BundleRegistry {
    cache: Arc<Cache>,
    transport: Arc<dyn Transport>,
    manifest_loader: Arc<dyn BundleManifestLoader>,
    recipe_loader: Arc<dyn RecipeLoader>,
    bundles: Mutex<HashMap<String, Arc<ResolvedBundle>>>,
}

impl BundleRegistry {
    pub fn new(
        cache: Arc<Cache>,
        transport: Arc<dyn Transport>,
        manifest_loader: Arc<dyn BundleManifestLoader>,
        recipe_loader: Arc<dyn RecipeLoader>,
    ) -> Self {
        BundleRegistry {
            cache,
            transport,
            manifest_loader,
            recipe_loader,
            bundles: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `spec_identity`'s on-disk path within the bundle identified
    /// by `bundle_identity`, fetching/extracting/validating the bundle on
    /// first use.
    pub fn resolve_spec_path(
        &self,
        bundle_identity: &str,
        underlying_fetch_source: &RecipeSource,
        spec_identity: &str,
    ) -> Result<PathBuf> {
        let bundle = self.ensure_bundle(bundle_identity, underlying_fetch_source)?;
        let relpath = bundle.manifest.specs.get(spec_identity).ok_or_else(|| {
            Error::MalformedRecipe {
                path: None,
                reason: format!(
                    "bundle {bundle_identity}: no spec registered for identity {spec_identity:?}"
                ),
            }
        })?;
        Ok(bundle.root.join(relpath))
    }

    fn ensure_bundle(
        &self,
        bundle_identity: &str,
        source: &RecipeSource,
    ) -> Result<Arc<ResolvedBundle>> {
        if let Some(existing) = self.bundles.lock().expect("poisoned").get(bundle_identity) {
            return Ok(existing.clone());
        }

        let ensured = self.cache.ensure_spec(bundle_identity)?;
        let root = if let Some(path) = ensured.pkg_path {
            path
        } else {
            let mut lock = ensured.lock.expect("miss implies a lock");
            std::fs::create_dir_all(lock.install_dir())?;
            self.fetch_and_extract(source, &lock)?;
            lock.mark_install_complete();
            let install_dir = lock.install_dir();
            lock.finish()?;
            install_dir
        };

        let manifest_path = root.join("envy-bundle.lua");
        let manifest = self.manifest_loader.load(&manifest_path)?;
        manifest.validate(bundle_identity)?;
        self.validate_specs(&root, &manifest)?;

        let resolved = Arc::new(ResolvedBundle { root, manifest });
        self.bundles
            .lock()
            .expect("poisoned")
            .entry(bundle_identity.to_string())
            .or_insert_with(|| resolved.clone());
        info!(bundle = bundle_identity, "bundle resolved");
        Ok(resolved)
    }

    fn fetch_and_extract(&self, source: &RecipeSource, lock: &crate::cache::ScopedEntryLock) -> Result<()> {
        match source {
            RecipeSource::Remote { url, sha256 } => {
                let archive_path = lock.fetch_dir().join("bundle.archive");
                std::fs::create_dir_all(lock.fetch_dir())?;
                self.transport.fetch_to(url, &archive_path)?;
                if let Some(expected) = sha256 {
                    let actual = crate::hash::sha256(&std::fs::read(&archive_path)?);
                    if &actual != expected {
                        return Err(Error::HashMismatch {
                            path: archive_path,
                            expected: expected.clone(),
                            actual,
                        });
                    }
                }
                crate::archive::extract(&archive_path, &lock.install_dir(), 0)?;
                Ok(())
            }
            RecipeSource::Local { path } => {
                Ok(crate::fs_util::copy_dir_recursive(path, &lock.install_dir())?)
            }
            RecipeSource::Git { url, git_ref } => {
                crate::shell::run(
                    &format!("git clone --depth 1 --branch {git_ref} {url} ."),
                    &lock.install_dir(),
                    &crate::shell::RunOptions {
                        check: true,
                        ..Default::default()
                    },
                )?;
                Ok(())
            }
            RecipeSource::FetchFunction { .. } | RecipeSource::Bundle { .. } | RecipeSource::WeakRef => {
                Err(Error::MalformedRecipe {
                    path: None,
                    reason: "bundle source must resolve to remote, local, or git".into(),
                })
            }
        }
    }

    /// Validate every `(identity, relpath)` entry in parallel: load just the
    /// spec file and compare its self-declared identity to the map key.
    fn validate_specs(&self, root: &Path, manifest: &BundleManifest) -> Result<()> {
        let handles: Vec<_> = manifest
            .specs
            .iter()
            .map(|(identity, relpath)| {
                let identity = identity.clone();
                let spec_path = root.join(relpath);
                let loader = self.recipe_loader.clone();
                std::thread::spawn(move || -> Result<()> {
                    let script = loader.load(&spec_path, &identity)?;
                    if script.identity != identity {
                        return Err(Error::IdentityMismatch {
                            declared: script.identity,
                            expected: identity,
                        });
                    }
                    Ok(())
                })
            })
            .collect();

        let mut first_error = None;
        for handle in handles {
            if let Err(e) = handle.join().expect("validation worker panicked") {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
