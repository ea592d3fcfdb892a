//! The seven phase implementations (component C7): the per-phase logic the
//! worker loop in `package::run_worker_loop` drives, dispatching on the
//! tagged-variant verbs a loaded `RecipeScript` carries.

use std::sync::Arc;

use tracing::{debug, info};

use crate::bundle::BundleRegistry;
use crate::cache::{Cache, CacheAddress, EnsureResult};
use crate::contract::{LocalTransport, PhaseContext, Transport};
use crate::descriptor::{DescriptorSpec, RecipeSource};
use crate::error::{Error, Result};
use crate::hash::cache_address_hash;
use crate::package::{DependencyInfo, Package, PackageKind};
use crate::phase::Phase;
use crate::platform::{Arch, Platform};
use crate::recipe::{BuildVerb, CheckVerb, DependencyDeclaration, DependencySource, FetchVerb,
    FunctionOutcome, InstallVerb, RecipeLoader, StageVerb};
use crate::registry::Engine;

/// Everything the phase implementations need that a `Run` (see `config.rs`)
/// owns for the lifetime of a single invocation.
pub struct PhaseRunner {
    pub engine: Arc<Engine>,
    pub cache: Arc<Cache>,
    pub loader: Arc<dyn RecipeLoader>,
    pub transport: Arc<dyn Transport>,
    pub descriptor_pool: Arc<crate::descriptor::DescriptorPool>,
    pub platform: Platform,
    pub arch: Arch,
    pub project_root: std::path::PathBuf,
    pub bundle_registry: Arc<BundleRegistry>,
}

impl PhaseRunner {
    pub fn new(
        engine: Arc<Engine>,
        cache: Arc<Cache>,
        loader: Arc<dyn RecipeLoader>,
        bundle_manifest_loader: Arc<dyn crate::bundle::BundleManifestLoader>,
    ) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport);
        let bundle_registry = Arc::new(BundleRegistry::new(
            cache.clone(),
            transport.clone(),
            bundle_manifest_loader,
            loader.clone(),
        ));
        PhaseRunner {
            engine,
            cache,
            loader,
            transport,
            descriptor_pool: Arc::new(crate::descriptor::DescriptorPool::new()),
            platform: Platform::detect(),
            arch: Arch::detect(),
            project_root: std::env::current_dir().unwrap_or_default(),
            bundle_registry,
        }
    }

    /// The function handed to `Package::run_worker_loop`.
    pub fn run(&self, pkg: &Arc<Package>, phase: Phase) -> Result<()> {
        // Once a package's asset path is already known (cache hit or a
        // prior phase finished it early), remaining phases are no-ops.
        if phase != Phase::SpecFetch
            && phase != Phase::Completion
            && pkg.pkg_path.lock().expect("poisoned").is_some()
            && *pkg.kind.lock().expect("poisoned") != PackageKind::Unknown
        {
            debug!(identity = pkg.identity(), phase = %phase, "asset already resolved, skipping");
            return Ok(());
        }

        match phase {
            Phase::SpecFetch => self.spec_fetch(pkg),
            Phase::Check => self.check(pkg),
            Phase::Fetch => self.fetch(pkg),
            Phase::Stage => self.stage(pkg),
            Phase::Build => self.build(pkg),
            Phase::Install => self.install(pkg),
            Phase::Completion => self.completion(pkg),
        }
    }

    fn resolve_recipe_path(&self, pkg: &Arc<Package>) -> Result<std::path::PathBuf> {
        match &pkg.descriptor.source {
            RecipeSource::Local { path } => Ok(path.clone()),
            RecipeSource::Remote { url, sha256 } => {
                let ensured = self.cache.ensure_spec(pkg.identity())?;
                if let Some(path) = ensured.pkg_path {
                    return Ok(path.join("recipe.lua"));
                }
                let mut lock = ensured.lock.expect("miss implies a lock");
                let dest = lock.fetch_dir().join("recipe.lua");
                std::fs::create_dir_all(lock.fetch_dir())?;
                self.transport.fetch_to(url, &dest)?;
                if let Some(expected) = sha256 {
                    let actual = crate::hash::sha256(&std::fs::read(&dest)?);
                    if &actual != expected {
                        return Err(Error::HashMismatch {
                            path: dest,
                            expected: expected.clone(),
                            actual,
                        });
                    }
                }
                std::fs::create_dir_all(lock.install_dir())?;
                let final_path = lock.install_dir().join("recipe.lua");
                crate::fs_util::move_file_atomic(&dest, &final_path)?;
                lock.mark_install_complete();
                lock.finish()?;
                Ok(final_path)
            }
            RecipeSource::Git { url, git_ref } => {
                let ensured = self.cache.ensure_spec(pkg.identity())?;
                if let Some(path) = ensured.pkg_path {
                    return Ok(path.join("recipe.lua"));
                }
                let mut lock = ensured.lock.expect("miss implies a lock");
                let outcome = crate::shell::run(
                    &format!("git clone --depth 1 --branch {git_ref} {url} ."),
                    &lock.install_dir(),
                    &crate::shell::RunOptions {
                        check: true,
                        ..Default::default()
                    },
                );
                std::fs::create_dir_all(lock.install_dir())?;
                outcome?;
                lock.mark_install_complete();
                let final_path = lock.install_dir().join("recipe.lua");
                lock.finish()?;
                Ok(final_path)
            }
            RecipeSource::Bundle {
                bundle_identity,
                underlying_fetch_source,
            } => self.bundle_registry.resolve_spec_path(
                bundle_identity,
                underlying_fetch_source,
                pkg.identity(),
            ),
            RecipeSource::FetchFunction { .. } | RecipeSource::WeakRef => {
                Err(Error::MalformedRecipe {
                    path: None,
                    reason: format!(
                        "{}: recipe source has no resolvable on-disk path",
                        pkg.identity()
                    ),
                })
            }
        }
    }

    /// Phase 0: resolve and parse the recipe, register declared
    /// dependencies (strong and weak), and classify the package kind.
    fn spec_fetch(&self, pkg: &Arc<Package>) -> Result<()> {
        let result = self.spec_fetch_inner(pkg);
        self.engine.end_spec_fetch();
        result
    }

    fn spec_fetch_inner(&self, pkg: &Arc<Package>) -> Result<()> {
        let path = self.resolve_recipe_path(pkg)?;
        let recipe = self.loader.load(&path, pkg.identity())?;
        recipe.validate_shape()?;
        if recipe.identity != pkg.identity() {
            return Err(Error::IdentityMismatch {
                declared: recipe.identity.clone(),
                expected: pkg.identity().to_string(),
            });
        }

        *pkg.kind.lock().expect("poisoned") = if recipe.is_user_managed() {
            PackageKind::UserManaged
        } else {
            PackageKind::CacheManaged
        };

        for dep in &recipe.dependencies {
            self.register_dependency(pkg, dep)?;
        }
        pkg.products
            .lock()
            .expect("poisoned")
            .extend(recipe.products.clone());

        *pkg.recipe.lock().expect("poisoned") = Some(recipe);
        Ok(())
    }

    fn register_dependency(&self, pkg: &Arc<Package>, decl: &DependencyDeclaration) -> Result<()> {
        let needed_by = match &decl.needed_by {
            Some(s) => Some(crate::phase::NeededBy::parse(s)?),
            None => None,
        };

        if decl.source.is_none() {
            // A weak reference: resolved later, against the live graph.
            let query = decl
                .identity
                .clone()
                .or_else(|| decl.product.clone())
                .ok_or_else(|| Error::MalformedRecipe {
                    path: None,
                    reason: format!("{}: weak dependency is missing a query", pkg.identity()),
                })?;
            let fallback = match &decl.weak_fallback {
                Some(fb) => Some(self.emplace_descriptor(pkg, fb, needed_by)?),
                None => None,
            };
            pkg.weak_references
                .lock()
                .expect("poisoned")
                .push(crate::package::WeakReference {
                    query,
                    fallback,
                    needed_by: needed_by.unwrap_or_default(),
                });
            return Ok(());
        }

        let descriptor = self.emplace_descriptor(pkg, decl, needed_by)?;
        let child_identity = descriptor.identity.as_str().to_string();
        pkg.check_cycle(&child_identity)?;

        let child = self
            .engine
            .ensure_pkg(descriptor, pkg.child_ancestor_chain())?;

        let effective_needed_by = needed_by.unwrap_or_default();
        pkg.dependencies.lock().expect("poisoned").insert(
            child_identity.clone(),
            DependencyInfo {
                package: child.clone(),
                needed_by: effective_needed_by,
            },
        );
        pkg.declared_dependencies
            .lock()
            .expect("poisoned")
            .push(child_identity);

        if let Some(product) = &decl.product {
            pkg.product_dependencies.lock().expect("poisoned").insert(
                product.clone(),
                crate::package::ProductDependencyInfo {
                    needed_by: effective_needed_by,
                    provider: child.clone(),
                    constraint_identity: decl.identity.clone(),
                },
            );
        }

        self.spawn_worker_if_new(child);
        Ok(())
    }

    fn emplace_descriptor(
        &self,
        parent: &Arc<Package>,
        decl: &DependencyDeclaration,
        needed_by: Option<crate::phase::NeededBy>,
    ) -> Result<crate::descriptor::DescriptorRef> {
        let identity = decl
            .identity
            .clone()
            .ok_or_else(|| Error::MalformedRecipe {
                path: None,
                reason: format!("{}: dependency is missing an identity", parent.identity()),
            })?;
        let source = match &decl.source {
            Some(DependencySource::UrlOrPath { value, sha256 }) => {
                if value.starts_with("http://") || value.starts_with("https://") {
                    RecipeSource::Remote {
                        url: value.clone(),
                        sha256: sha256.clone(),
                    }
                } else {
                    RecipeSource::Local { path: value.into() }
                }
            }
            Some(DependencySource::Git { url, git_ref }) => RecipeSource::Git {
                url: url.clone(),
                git_ref: git_ref.clone(),
            },
            Some(DependencySource::Custom { .. }) => RecipeSource::FetchFunction {
                source_dependencies: vec![],
            },
            None => {
                return Err(Error::MalformedRecipe {
                    path: None,
                    reason: format!("{}: dependency source missing", parent.identity()),
                })
            }
        };

        self.descriptor_pool.emplace(DescriptorSpec {
            identity,
            source: Some(source),
            options: decl.options.clone(),
            needed_by: needed_by.map(|n| n.name().to_string()),
            parent: Some(Arc::downgrade(&parent.descriptor)),
            weak_fallback: None,
            product: decl.product.clone(),
            declaring_file_path: None,
            bundle_identity: None,
        })
    }

    pub fn spawn_worker_if_new(&self, child: Arc<Package>) {
        if !child.exec_ctx.try_claim_worker() {
            return;
        }
        // Counted synchronously, on the spawning thread, so a caller that
        // immediately calls `wait_for_resolution_phase` never observes a
        // count of zero before the new worker's spec_fetch has a chance to
        // run (spec §4.4: the barrier must see the full graph).
        self.engine.begin_spec_fetch();
        child.exec_ctx.set_target_phase(Phase::Completion);
        let runner = self.clone_for_worker();
        let handle = std::thread::spawn(move || {
            let child_for_loop = child.clone();
            child_for_loop.run_worker_loop(move |p, phase| runner.run(p, phase));
        });
        self.engine.track_worker(handle);
    }

    fn clone_for_worker(&self) -> Arc<PhaseRunner> {
        // PhaseRunner itself is cheap to share; callers hold it behind an
        // Arc already (see `config::Run`).
        Arc::new(PhaseRunner {
            engine: self.engine.clone(),
            cache: self.cache.clone(),
            loader: self.loader.clone(),
            transport: self.transport.clone(),
            descriptor_pool: self.descriptor_pool.clone(),
            platform: self.platform,
            arch: self.arch,
            project_root: self.project_root.clone(),
            bundle_registry: self.bundle_registry.clone(),
        })
    }

    /// Phase 1: for a user-managed package, run the check verb and decide
    /// whether the host system already satisfies the dependency. For a
    /// cache-managed package this is a pass-through; the cache lookup
    /// itself happens at `fetch`.
    ///
    /// Spec §4.7: a failed check acquires the entry lock (double-checked
    /// locking against a concurrent process), re-runs the check under the
    /// lock, and either releases (someone else finished first) or runs
    /// install and marks the lock user-managed so its destruction leaves no
    /// cache artifact behind (spec E6).
    fn check(&self, pkg: &Arc<Package>) -> Result<()> {
        if !self.run_check_verb(pkg)? {
            return Ok(());
        }
        info!(identity = pkg.identity(), "user-managed check satisfied");
        Ok(())
    }

    /// Runs the check verb once; if it fails, acquires the entry lock,
    /// re-checks, and installs if still unsatisfied. Returns `true` when the
    /// check passed (either before or after acquiring the lock).
    fn run_check_verb(&self, pkg: &Arc<Package>) -> Result<bool> {
        if self.evaluate_check(pkg)? {
            return Ok(true);
        }

        self.engine.wait_for_resolution_phase();
        let weak_keys = pkg
            .resolved_weak_dependency_keys
            .lock()
            .expect("poisoned")
            .clone();
        let address_hash = cache_address_hash(pkg.key.as_str(), &weak_keys);
        pkg.set_canonical_identity_hash(address_hash.as_str());
        let address = CacheAddress {
            identity: pkg.identity().to_string(),
            platform: self.platform,
            arch: self.arch,
            hash_prefix: address_hash.short_prefix().to_string(),
        };
        let EnsureResult { pkg_path: _, lock } = self.cache.ensure_asset(&address)?;
        let Some(mut lock) = lock else {
            // Another process finished the install between our unlocked
            // check and the lock acquisition: nothing left to do.
            return Ok(true);
        };

        // Double-checked locking (spec §4.7 phase 1(b)): a concurrent
        // process may have completed the install while we waited for the
        // lock.
        if self.evaluate_check(pkg)? {
            lock.finish()?;
            return Ok(true);
        }

        lock.mark_user_managed();
        let recipe_guard = pkg.recipe.lock().expect("poisoned");
        let recipe = recipe_guard.as_ref().expect("spec_fetch populates recipe");
        match &recipe.install {
            InstallVerb::Shell(script) => {
                let script = script.clone();
                drop(recipe_guard);
                crate::shell::run(
                    &script,
                    &self.config_project_root(),
                    &crate::shell::RunOptions {
                        check: true,
                        ..Default::default()
                    },
                )?;
            }
            InstallVerb::Function(f) => {
                let f = f.clone();
                let ctx = self.context_for_user_managed(pkg, &lock);
                drop(recipe_guard);
                if let FunctionOutcome::RunShell(script) = f(&ctx)? {
                    crate::shell::run(
                        &script,
                        &self.config_project_root(),
                        &crate::shell::RunOptions {
                            check: true,
                            ..Default::default()
                        },
                    )?;
                }
            }
            InstallVerb::Nil => {
                return Err(Error::MalformedRecipe {
                    path: None,
                    reason: format!("{}: CHECK requires INSTALL", pkg.identity()),
                });
            }
        }
        // mark_user_managed + finish removes the entry directory: spec §9
        // Open Questions preserves "no marker, no cache entry left behind".
        lock.finish()?;
        Ok(false)
    }

    fn evaluate_check(&self, pkg: &Arc<Package>) -> Result<bool> {
        let recipe_guard = pkg.recipe.lock().expect("poisoned");
        let recipe = recipe_guard.as_ref().expect("spec_fetch populates recipe");
        let Some(check) = &recipe.check else {
            return Ok(true);
        };
        let options = self.options_for(pkg);
        match check {
            CheckVerb::Shell(script) => {
                let script = script.clone();
                drop(recipe_guard);
                let outcome = crate::shell::run(
                    &script,
                    &self.config_project_root(),
                    &crate::shell::RunOptions {
                        check: false,
                        ..Default::default()
                    },
                )?;
                Ok(outcome.exit_code == Some(0))
            }
            CheckVerb::Function(f) => f(&options),
        }
    }

    fn config_project_root(&self) -> std::path::PathBuf {
        self.project_root.clone()
    }

    /// A `PhaseContext` for a user-managed install function: `install_dir`
    /// is `None` (spec §4.7 phase 5: "`install_dir` is nil when user-managed").
    fn context_for_user_managed(&self, pkg: &Arc<Package>, lock: &crate::cache::ScopedEntryLock) -> PhaseContext {
        PhaseContext {
            phase: Phase::Check,
            fetch_dir: lock.fetch_dir(),
            stage_dir: lock.stage_dir(),
            tmp_dir: lock.tmp_dir(),
            install_dir: None,
            work_dir: self.config_project_root(),
            options: self.options_for(pkg),
            env: crate::platform::env_vars(self.platform, self.arch).into_iter().collect(),
            default_shell: pkg
                .recipe
                .lock()
                .expect("poisoned")
                .as_ref()
                .and_then(|r| r.default_shell.clone()),
            package: pkg.clone(),
            transport: self.transport.clone(),
        }
    }

    fn options_for(&self, pkg: &Arc<Package>) -> crate::options::OptionValue {
        crate::options::parse(pkg.key.as_str())
            .ok()
            .unwrap_or(crate::options::OptionValue::Table(Default::default()))
    }

    /// Phase 2: resolve the cache address (cache-managed only) and either
    /// short-circuit on a hit or run the fetch verb into `entry/fetch`.
    fn fetch(&self, pkg: &Arc<Package>) -> Result<()> {
        if *pkg.kind.lock().expect("poisoned") == PackageKind::UserManaged {
            return Ok(());
        }

        self.engine.wait_for_resolution_phase();

        let weak_keys = pkg
            .resolved_weak_dependency_keys
            .lock()
            .expect("poisoned")
            .clone();
        let address_hash = cache_address_hash(pkg.key.as_str(), &weak_keys);
        pkg.set_canonical_identity_hash(address_hash.as_str());
        let address = CacheAddress {
            identity: pkg.identity().to_string(),
            platform: self.platform,
            arch: self.arch,
            hash_prefix: address_hash.short_prefix().to_string(),
        };

        let EnsureResult { pkg_path, lock } = self.cache.ensure_asset(&address)?;
        if let Some(path) = pkg_path {
            *pkg.pkg_path.lock().expect("poisoned") = Some(path);
            *pkg.result_hash.lock().expect("poisoned") = Some(address_hash.as_str().to_string());
            debug!(identity = pkg.identity(), "cache hit");
            return Ok(());
        }
        let mut lock = lock.expect("miss implies a lock");

        if lock.is_fetch_complete() {
            // Resuming after a crash between fetch and install: entry/fetch
            // already holds the fetched content, so reuse it rather than
            // running the fetch verb (and its network/process cost) again.
            debug!(identity = pkg.identity(), "fetch already complete, reusing entry/fetch");
            *pkg.entry_lock.lock().expect("poisoned") = Some(lock);
            return Ok(());
        }

        let recipe_guard = pkg.recipe.lock().expect("poisoned");
        let recipe = recipe_guard.as_ref().expect("spec_fetch populates recipe");
        let ctx = self.context_for(pkg, Phase::Fetch, &lock);
        match &recipe.fetch {
            FetchVerb::Nil => {}
            FetchVerb::Declarative(items) => {
                let names = ctx.fetch(items, None)?;
                let pairs: Vec<(String, Option<String>)> = items
                    .iter()
                    .zip(names)
                    .map(|(item, name)| (name, item.sha256.clone()))
                    .collect();
                ctx.commit_fetch(&pairs)?;
            }
            FetchVerb::Function(f) => match f(&ctx)? {
                FunctionOutcome::Declarative(items) => {
                    let names = ctx.fetch(&items, None)?;
                    let pairs: Vec<(String, Option<String>)> = items
                        .iter()
                        .zip(names)
                        .map(|(item, name)| (name, item.sha256.clone()))
                        .collect();
                    ctx.commit_fetch(&pairs)?;
                }
                FunctionOutcome::RunShell(script) => {
                    ctx.run(&script, crate::shell::RunOptions::default())?;
                }
                FunctionOutcome::None => {}
            },
        }
        drop(recipe_guard);

        lock.mark_fetch_complete()?;
        *pkg.entry_lock.lock().expect("poisoned") = Some(lock);
        Ok(())
    }

    fn context_for(&self, pkg: &Arc<Package>, phase: Phase, lock: &crate::cache::ScopedEntryLock) -> PhaseContext {
        PhaseContext {
            phase,
            fetch_dir: lock.fetch_dir(),
            stage_dir: lock.stage_dir(),
            tmp_dir: lock.tmp_dir(),
            install_dir: Some(lock.install_dir()),
            work_dir: lock.work_dir(),
            options: self.options_for(pkg),
            env: crate::platform::env_vars(self.platform, self.arch).into_iter().collect(),
            default_shell: pkg
                .recipe
                .lock()
                .expect("poisoned")
                .as_ref()
                .and_then(|r| r.default_shell.clone()),
            package: pkg.clone(),
            transport: self.transport.clone(),
        }
    }

    /// Phase 3: unpack `entry/fetch` into `entry/stage` per the stage verb.
    fn stage(&self, pkg: &Arc<Package>) -> Result<()> {
        if *pkg.kind.lock().expect("poisoned") == PackageKind::UserManaged {
            return Ok(());
        }
        let entry_lock = pkg.entry_lock.lock().expect("poisoned");
        let Some(lock) = entry_lock.as_ref() else {
            return Ok(());
        };
        let ctx = self.context_for(pkg, Phase::Stage, lock);
        let recipe_guard = pkg.recipe.lock().expect("poisoned");
        let recipe = recipe_guard.as_ref().expect("spec_fetch populates recipe");
        match &recipe.stage {
            StageVerb::Nil => {
                ctx.extract_all(&ctx.fetch_dir, &ctx.stage_dir, 0)?;
            }
            StageVerb::Shell(script) => {
                ctx.run(script, crate::shell::RunOptions::default())?;
            }
            StageVerb::Table { strip } => {
                ctx.extract_all(&ctx.fetch_dir, &ctx.stage_dir, *strip)?;
            }
            StageVerb::Function(f) => {
                if let FunctionOutcome::RunShell(script) = f(&ctx)? {
                    ctx.run(&script, crate::shell::RunOptions::default())?;
                }
            }
        }
        Ok(())
    }

    /// Phase 4: run the build verb in `entry/stage`.
    fn build(&self, pkg: &Arc<Package>) -> Result<()> {
        if *pkg.kind.lock().expect("poisoned") == PackageKind::UserManaged {
            return Ok(());
        }
        let entry_lock = pkg.entry_lock.lock().expect("poisoned");
        let Some(lock) = entry_lock.as_ref() else {
            return Ok(());
        };
        let ctx = self.context_for(pkg, Phase::Build, lock);
        let recipe_guard = pkg.recipe.lock().expect("poisoned");
        let recipe = recipe_guard.as_ref().expect("spec_fetch populates recipe");
        match &recipe.build {
            BuildVerb::Nil => {}
            BuildVerb::Shell(script) => {
                let mut opts = crate::shell::RunOptions::default();
                opts.cwd = Some(ctx.stage_dir.clone());
                opts.check = true;
                ctx.run(script, opts)?;
            }
            BuildVerb::Function(f) => {
                if let FunctionOutcome::RunShell(script) = f(&ctx)? {
                    let mut opts = crate::shell::RunOptions::default();
                    opts.cwd = Some(ctx.stage_dir.clone());
                    opts.check = true;
                    ctx.run(&script, opts)?;
                }
            }
        }
        Ok(())
    }

    /// Phase 5: run the install verb, producing `entry/install` (spec
    /// §4.7 phase 5). Dispatch on the verb decides whether the entry is
    /// eligible for the `envy-install-complete` marker: nil only marks
    /// complete when `install/` or `stage/` actually has content; a
    /// function only marks complete on a `None`/successful-shell outcome.
    fn install(&self, pkg: &Arc<Package>) -> Result<()> {
        if *pkg.kind.lock().expect("poisoned") == PackageKind::UserManaged {
            return Ok(());
        }
        let entry_lock = pkg.entry_lock.lock().expect("poisoned");
        let Some(lock) = entry_lock.as_ref() else {
            return Ok(());
        };
        let ctx = self.context_for(pkg, Phase::Install, lock);
        let install_dir = ctx.install_dir.clone().unwrap();
        let recipe_guard = pkg.recipe.lock().expect("poisoned");
        let recipe = recipe_guard.as_ref().expect("spec_fetch populates recipe");
        let should_complete = match &recipe.install {
            InstallVerb::Nil => {
                if crate::fs_util::dir_has_entries(&install_dir) {
                    true
                } else if crate::fs_util::dir_has_entries(&ctx.stage_dir) {
                    crate::fs_util::remove_dir_if_exists(&install_dir)?;
                    crate::fs_util::move_dir_atomic(&ctx.stage_dir, &install_dir)?;
                    true
                } else {
                    false
                }
            }
            InstallVerb::Shell(script) => {
                std::fs::create_dir_all(&install_dir)?;
                let mut opts = crate::shell::RunOptions::default();
                opts.cwd = Some(install_dir.clone());
                opts.check = true;
                ctx.run(script, opts)?;
                true
            }
            InstallVerb::Function(f) => {
                std::fs::create_dir_all(&install_dir)?;
                match f(&ctx)? {
                    FunctionOutcome::None => true,
                    FunctionOutcome::RunShell(script) => {
                        let mut opts = crate::shell::RunOptions::default();
                        opts.cwd = Some(install_dir.clone());
                        opts.check = true;
                        ctx.run(&script, opts)?;
                        true
                    }
                    FunctionOutcome::Declarative(_) => true,
                }
            }
        };
        drop(recipe_guard);
        *pkg.install_should_complete.lock().expect("poisoned") = should_complete;
        Ok(())
    }

    /// Phase 6: promote the finished entry to `asset/`, or tear down an
    /// aborted one, and record the final path/hash on the package.
    fn completion(&self, pkg: &Arc<Package>) -> Result<()> {
        let kind = *pkg.kind.lock().expect("poisoned");
        let should_complete = *pkg.install_should_complete.lock().expect("poisoned");
        let entry_lock = pkg.entry_lock.lock().expect("poisoned").take();
        if let Some(mut lock) = entry_lock {
            if should_complete {
                lock.mark_install_complete();
            }
            let asset_path = lock.finish()?;
            *pkg.pkg_path.lock().expect("poisoned") = asset_path;
        }
        if kind == PackageKind::UserManaged {
            // Spec §3 package-type invariants: the sentinel, never the key.
            *pkg.result_hash.lock().expect("poisoned") = Some("user-managed".to_string());
        } else if pkg.result_hash.lock().expect("poisoned").is_none() {
            // Spec §4.7 phase 6: "Set result_hash = canonical_identity_hash
            // for cache-managed". `fetch()` always populates the latter
            // before this phase runs; recompute only as a defensive
            // fallback if it somehow didn't.
            let existing = pkg.canonical_identity_hash.lock().expect("poisoned").clone();
            let hash = match existing {
                Some(hash) => hash,
                None => {
                    let weak_keys = pkg
                        .resolved_weak_dependency_keys
                        .lock()
                        .expect("poisoned")
                        .clone();
                    let address_hash = cache_address_hash(pkg.key.as_str(), &weak_keys);
                    pkg.set_canonical_identity_hash(address_hash.as_str());
                    address_hash.as_str().to_string()
                }
            };
            *pkg.result_hash.lock().expect("poisoned") = Some(hash);
        }
        info!(identity = pkg.identity(), "package complete");
        Ok(())
    }
}
