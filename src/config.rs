//! Run configuration and the top-level `Run` entry point (spec §9 Design
//! Notes: "a `Run` owns a descriptor pool, a cache, and an engine registry
//! ... constructed once, destroyed on return, no process-level statics").

use std::path::PathBuf;
use std::sync::Arc;

use crate::bundle::BundleManifestLoader;
use crate::cache::{Cache, CacheConfig};
use crate::descriptor::{DescriptorPool, DescriptorSpec, RecipeSource};
use crate::error::Result;
use crate::phases::PhaseRunner;
use crate::platform::{Arch, Platform};
use crate::recipe::RecipeLoader;
use crate::registry::Engine;

/// Host-supplied configuration for a single invocation (spec §3 "Run").
#[derive(Clone)]
pub struct RunConfig {
    pub cache_root: PathBuf,
    pub platform: Platform,
    pub arch: Arch,
    pub project_root: PathBuf,
    /// Soft hint only; the engine does not itself bound worker concurrency
    /// (spec §5 leaves it unbounded).
    pub max_parallel_fetch: Option<usize>,
}

impl RunConfig {
    pub fn new(cache_root: impl Into<PathBuf>, project_root: impl Into<PathBuf>) -> Self {
        RunConfig {
            cache_root: cache_root.into(),
            platform: Platform::detect(),
            arch: Arch::detect(),
            project_root: project_root.into(),
            max_parallel_fetch: None,
        }
    }
}

/// The crate's single entry point: owns the descriptor pool, cache, and
/// engine registry for one invocation's lifetime.
pub struct Run {
    config: RunConfig,
    engine: Arc<Engine>,
    cache: Arc<Cache>,
    descriptor_pool: Arc<DescriptorPool>,
    runner: Arc<PhaseRunner>,
}

impl Run {
    pub fn new(
        config: RunConfig,
        loader: Arc<dyn RecipeLoader>,
        bundle_manifest_loader: Arc<dyn BundleManifestLoader>,
    ) -> Self {
        let engine = Arc::new(Engine::new());
        let cache = Arc::new(Cache::new(CacheConfig {
            cache_root: config.cache_root.clone(),
        }));
        let mut runner = PhaseRunner::new(engine.clone(), cache.clone(), loader, bundle_manifest_loader);
        runner.platform = config.platform;
        runner.arch = config.arch;
        runner.project_root = config.project_root.clone();
        let descriptor_pool = runner.descriptor_pool.clone();
        Run {
            config,
            engine,
            cache,
            descriptor_pool,
            runner: Arc::new(runner),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Build one or more root packages to completion, returning
    /// canonical_key -> (result_hash, pkg_path) for every package touched
    /// (spec §4.5 `run_full`).
    pub fn build(
        &self,
        roots: Vec<DescriptorSpec>,
    ) -> Result<std::collections::HashMap<String, (String, Option<PathBuf>)>> {
        let mut root_packages = Vec::new();
        for spec in roots {
            let descriptor = self.descriptor_pool.emplace(spec)?;
            let pkg = self.engine.ensure_pkg(descriptor, vec![])?;
            self.runner.spawn_worker_if_new(pkg.clone());
            root_packages.push(pkg);
        }

        // Discovery barrier: wait until every in-flight spec_fetch has
        // registered its dependencies, so weak references see the full
        // graph (spec §4.4/§4.5).
        self.engine.wait_for_resolution_phase();
        self.engine.resolve_weak_references()?;

        // A fallback-resolved weak reference may have created a package
        // with no worker yet; sweep once more before the build barrier.
        for pkg in self.engine.all_packages() {
            self.runner.spawn_worker_if_new(pkg);
        }

        self.engine.run_full(root_packages)
    }

    /// Convenience for a single local recipe root (spec §6 "local" sources).
    pub fn build_local(&self, identity: &str, path: impl Into<PathBuf>) -> Result<Option<PathBuf>> {
        let results = self.build(vec![DescriptorSpec {
            identity: identity.to_string(),
            source: Some(RecipeSource::Local { path: path.into() }),
            options: crate::options::OptionValue::Table(Default::default()),
            needed_by: None,
            parent: None,
            weak_fallback: None,
            product: None,
            declaring_file_path: None,
            bundle_identity: None,
        }])?;
        Ok(results.get(identity).and_then(|(_, path)| path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{BundleManifest, BundleManifestLoader};
    use crate::error::{Error, Result as EnvyResult};
    use crate::recipe::{BuildVerb, FetchVerb, InstallVerb, RecipeScript, StageVerb};
    use std::path::Path;
    use tempfile::TempDir;

    struct FixedLoader {
        script: std::sync::Mutex<Option<RecipeScript>>,
    }

    impl RecipeLoader for FixedLoader {
        fn load(&self, _resolved_path: &Path, _expected_identity: &str) -> EnvyResult<RecipeScript> {
            self.script
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::MalformedRecipe {
                    path: None,
                    reason: "fixture already consumed".into(),
                })
        }
    }

    /// No package in these tests is bundle-sourced; any call is a bug.
    struct UnusedBundleLoader;

    impl BundleManifestLoader for UnusedBundleLoader {
        fn load(&self, _manifest_path: &Path) -> EnvyResult<BundleManifest> {
            Err(Error::MalformedRecipe {
                path: None,
                reason: "no bundle expected in this test".into(),
            })
        }
    }

    fn trivial_recipe(identity: &str) -> RecipeScript {
        RecipeScript {
            identity: identity.to_string(),
            dependencies: vec![],
            products: Default::default(),
            check: None,
            fetch: FetchVerb::Declarative(vec![]),
            stage: StageVerb::Nil,
            build: BuildVerb::Nil,
            install: InstallVerb::Shell("mkdir -p out && echo hi > out/hello.txt".into()),
            default_shell: None,
            needed_by: None,
        }
    }

    #[test]
    fn build_single_package_end_to_end() {
        let cache_dir = TempDir::new().unwrap();
        let recipe_dir = TempDir::new().unwrap();
        let config = RunConfig::new(cache_dir.path(), recipe_dir.path());
        let loader = Arc::new(FixedLoader {
            script: std::sync::Mutex::new(Some(trivial_recipe("foo.hello@v1"))),
        });
        let run = Run::new(config, loader, Arc::new(UnusedBundleLoader));
        let path = run.build_local("foo.hello@v1", recipe_dir.path()).unwrap();
        assert!(path.is_some());
        assert!(path.unwrap().join("hello.txt").exists());
    }

    #[test]
    fn malformed_recipe_shape_surfaces_as_error() {
        let cache_dir = TempDir::new().unwrap();
        let recipe_dir = TempDir::new().unwrap();
        let config = RunConfig::new(cache_dir.path(), recipe_dir.path());
        let mut bad = trivial_recipe("foo.broken@v1");
        bad.fetch = FetchVerb::Nil;
        bad.install = InstallVerb::Nil;
        let loader = Arc::new(FixedLoader {
            script: std::sync::Mutex::new(Some(bad)),
        });
        let run = Run::new(config, loader, Arc::new(UnusedBundleLoader));
        let result = run.build_local("foo.broken@v1", recipe_dir.path());
        assert!(result.is_err());
    }
}
