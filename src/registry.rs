//! Engine registry (component C5): deduplicates packages by canonical key,
//! owns packages and their execution contexts, and exposes lookup, alias,
//! and fuzzy-matching operations. Also implements weak-reference
//! resolution and the top-level `run_full` entry point (spec §4.5).

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info};

use crate::descriptor::DescriptorRef;
use crate::error::{Error, Result};
use crate::identity::CanonicalKey;
use crate::package::{Package, WeakReference};
use crate::phase::Phase;

struct RegistryState {
    packages: HashMap<String, Arc<Package>>,
    aliases: HashMap<String, String>,
}

/// Run-scoped singleton holding every package and alias created during a
/// run (spec §9 Design Notes: a `Run` owns the pool, cache, and engine and
/// destroys them on return; no process-level statics).
pub struct Engine {
    state: Mutex<RegistryState>,
    /// Count of in-flight spec-fetch operations, for `wait_for_resolution_phase`.
    in_flight_spec_fetch: Mutex<u32>,
    resolution_cv: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            state: Mutex::new(RegistryState {
                packages: HashMap::new(),
                aliases: HashMap::new(),
            }),
            in_flight_spec_fetch: Mutex::new(0),
            resolution_cv: Condvar::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Returns an existing package for `cfg`'s canonical key, or creates
    /// and registers a new one.
    pub fn ensure_pkg(&self, cfg: DescriptorRef, ancestor_chain: Vec<String>) -> Result<Arc<Package>> {
        let key = CanonicalKey::canonicalize(&cfg.identity, &parse_options(&cfg.serialized_options)?)?;
        let mut state = self.state.lock().expect("engine mutex poisoned");
        if let Some(existing) = state.packages.get(key.as_str()) {
            return Ok(existing.clone());
        }
        let package = Arc::new(Package::new(key.clone(), cfg, ancestor_chain));
        state.packages.insert(key.as_str().to_string(), package.clone());
        Ok(package)
    }

    pub fn register_alias(&self, alias: &str, key: &CanonicalKey) -> Result<()> {
        let mut state = self.state.lock().expect("engine mutex poisoned");
        if state.aliases.contains_key(alias) {
            return Err(Error::MalformedRecipe {
                path: None,
                reason: format!("alias {alias:?} already registered"),
            });
        }
        state.aliases.insert(alias.to_string(), key.as_str().to_string());
        Ok(())
    }

    pub fn find_exact(&self, key: &CanonicalKey) -> Option<Arc<Package>> {
        let state = self.state.lock().expect("engine mutex poisoned");
        state.packages.get(key.as_str()).cloned()
    }

    /// Every package whose key `matches(query)`, or whose alias equals
    /// `query` (spec §4.5).
    pub fn find_matches(&self, query: &str) -> Vec<Arc<Package>> {
        let state = self.state.lock().expect("engine mutex poisoned");
        let mut out = Vec::new();
        if let Some(aliased_key) = state.aliases.get(query) {
            if let Some(pkg) = state.packages.get(aliased_key) {
                out.push(pkg.clone());
            }
        }
        for pkg in state.packages.values() {
            if pkg.key.matches(query) && !out.iter().any(|p: &Arc<Package>| Arc::ptr_eq(p, pkg)) {
                out.push(pkg.clone());
            }
        }
        out
    }

    pub fn all_packages(&self) -> Vec<Arc<Package>> {
        self.state
            .lock()
            .expect("engine mutex poisoned")
            .packages
            .values()
            .cloned()
            .collect()
    }

    /// Increment the in-flight spec-fetch counter. Call before starting a
    /// thread at target >= spec_fetch.
    pub fn begin_spec_fetch(&self) {
        let mut n = self.in_flight_spec_fetch.lock().expect("engine mutex poisoned");
        *n += 1;
    }

    /// Decrement the counter on completion or error of the spec-fetch
    /// phase, waking any `wait_for_resolution_phase` waiters.
    pub fn end_spec_fetch(&self) {
        let mut n = self.in_flight_spec_fetch.lock().expect("engine mutex poisoned");
        *n -= 1;
        if *n == 0 {
            self.resolution_cv.notify_all();
        }
    }

    /// Block until the count of in-flight spec-fetch operations reaches
    /// zero, i.e. the full graph is known (spec §4.4).
    pub fn wait_for_resolution_phase(&self) {
        let guard = self.in_flight_spec_fetch.lock().expect("engine mutex poisoned");
        let _unused = self
            .resolution_cv
            .wait_while(guard, |n| *n > 0)
            .expect("engine mutex poisoned");
    }

    pub fn track_worker(&self, handle: JoinHandle<()>) {
        self.handles.lock().expect("engine mutex poisoned").push(handle);
    }

    /// Join every tracked worker thread (spec §9: "the engine's destructor
    /// joins all worker threads").
    pub fn join_all(&self) {
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().expect("engine mutex poisoned"));
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Weak-reference resolution (spec §4.5): for each package's unresolved
    /// weak references, find the live match, fall back, or fail.
    pub fn resolve_weak_references(&self) -> Result<()> {
        let packages = self.all_packages();
        for pkg in &packages {
            let refs: Vec<WeakReference> =
                std::mem::take(&mut *pkg.weak_references.lock().expect("package mutex poisoned"));
            for weak_ref in refs {
                self.resolve_one_weak_reference(pkg, weak_ref)?;
            }
        }
        Ok(())
    }

    fn resolve_one_weak_reference(&self, pkg: &Arc<Package>, weak_ref: WeakReference) -> Result<()> {
        let candidates: Vec<Arc<Package>> = self
            .find_matches(&weak_ref.query)
            .into_iter()
            .filter(|p| !Arc::ptr_eq(p, pkg))
            .collect();

        let resolved = match candidates.len() {
            1 => candidates.into_iter().next().unwrap(),
            0 => {
                let Some(fallback) = weak_ref.fallback else {
                    return Err(Error::UnresolvedWeakReference {
                        query: weak_ref.query,
                    });
                };
                self.ensure_pkg(fallback, pkg.child_ancestor_chain())?
            }
            _ => {
                return Err(Error::AmbiguousWeakReference {
                    query: weak_ref.query,
                    matches: candidates.iter().map(|p| p.key.as_str().to_string()).collect(),
                });
            }
        };

        debug!(
            parent = pkg.identity(),
            query = %weak_ref.query,
            resolved = resolved.identity(),
            "weak reference resolved"
        );

        pkg.resolved_weak_dependency_keys
            .lock()
            .expect("package mutex poisoned")
            .push(resolved.key.as_str().to_string());
        pkg.dependencies.lock().expect("package mutex poisoned").insert(
            resolved.identity().to_string(),
            crate::package::DependencyInfo {
                package: resolved,
                needed_by: weak_ref.needed_by,
            },
        );
        Ok(())
    }

    /// The top-level entry point (spec §4.5): spawn each root at target
    /// `completion`, wait on all threads, surface the first failure,
    /// otherwise return canonical_key -> (result_hash, pkg_path).
    pub fn run_full(
        self: &Arc<Self>,
        roots: Vec<Arc<Package>>,
    ) -> Result<HashMap<String, (String, Option<std::path::PathBuf>)>> {
        for root in &roots {
            root.exec_ctx.set_target_phase(Phase::Completion);
        }
        for root in &roots {
            root.exec_ctx.wait_for_completion().map_err(|_| {
                let msg = root
                    .exec_ctx
                    .error_message
                    .lock()
                    .expect("poisoned")
                    .clone()
                    .unwrap_or_else(|| format!("{} failed", root.identity()));
                Error::PhaseScriptFailure {
                    identity: root.identity().to_string(),
                    phase: root
                        .exec_ctx
                        .current_phase()
                        .map(|p| p.name().to_string())
                        .unwrap_or_default(),
                    reason: msg,
                    file: None,
                    provenance: vec![],
                }
            })?;
        }
        self.join_all();

        let mut results = HashMap::new();
        for pkg in self.all_packages() {
            let hash = pkg
                .result_hash
                .lock()
                .expect("poisoned")
                .clone()
                .unwrap_or_default();
            let path = pkg.pkg_path.lock().expect("poisoned").clone();
            results.insert(pkg.key.as_str().to_string(), (hash, path));
        }
        info!(count = results.len(), "run complete");
        Ok(results)
    }
}

fn parse_options(serialized: &str) -> Result<crate::options::OptionValue> {
    crate::options::parse(serialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorPool, DescriptorSpec, RecipeSource};
    use std::collections::BTreeMap;

    fn descriptor(pool: &DescriptorPool, identity: &str) -> DescriptorRef {
        pool.emplace(DescriptorSpec {
            identity: identity.into(),
            source: Some(RecipeSource::Local { path: "/tmp".into() }),
            options: crate::options::OptionValue::Table(BTreeMap::new()),
            needed_by: None,
            parent: None,
            weak_fallback: None,
            product: None,
            declaring_file_path: None,
            bundle_identity: None,
        })
        .unwrap()
    }

    #[test]
    fn ensure_pkg_deduplicates_by_canonical_key() {
        let engine = Engine::new();
        let pool = DescriptorPool::new();
        let d1 = descriptor(&pool, "foo.hello@v1");
        let d2 = descriptor(&pool, "foo.hello@v1");
        let p1 = engine.ensure_pkg(d1, vec![]).unwrap();
        let p2 = engine.ensure_pkg(d2, vec![]).unwrap();
        assert!(Arc::ptr_eq(&p1, &p2));
    }

    #[test]
    fn find_matches_fuzzy() {
        let engine = Engine::new();
        let pool = DescriptorPool::new();
        let d = descriptor(&pool, "vendor.python@r4");
        engine.ensure_pkg(d, vec![]).unwrap();
        assert_eq!(engine.find_matches("python").len(), 1);
        assert_eq!(engine.find_matches("vendor.python").len(), 1);
        assert_eq!(engine.find_matches("nonexistent").len(), 0);
    }

    #[test]
    fn resolution_barrier_releases_at_zero() {
        let engine = Arc::new(Engine::new());
        engine.begin_spec_fetch();
        let e2 = engine.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            e2.end_spec_fetch();
        });
        engine.wait_for_resolution_phase();
        handle.join().unwrap();
    }

    #[test]
    fn weak_reference_resolves_via_fallback() {
        let engine = Engine::new();
        let pool = DescriptorPool::new();
        let consumer_desc = descriptor(&pool, "local.consumer@v1");
        let consumer = engine.ensure_pkg(consumer_desc, vec![]).unwrap();
        let fallback = descriptor(&pool, "vendor.python@r4");
        consumer.weak_references.lock().unwrap().push(WeakReference {
            query: "python".into(),
            fallback: Some(fallback),
            needed_by: crate::phase::NeededBy::Build,
        });
        engine.resolve_weak_references().unwrap();
        let resolved = consumer.resolved_weak_dependency_keys.lock().unwrap();
        assert_eq!(resolved.as_slice(), ["vendor.python@r4"]);
    }

    #[test]
    fn weak_reference_ambiguous_fails() {
        let engine = Engine::new();
        let pool = DescriptorPool::new();
        let consumer_desc = descriptor(&pool, "local.consumer@v1");
        let consumer = engine.ensure_pkg(consumer_desc, vec![]).unwrap();
        engine.ensure_pkg(descriptor(&pool, "vendor.python@r4"), vec![]).unwrap();
        engine.ensure_pkg(descriptor(&pool, "other.python@r9"), vec![]).unwrap();
        consumer.weak_references.lock().unwrap().push(WeakReference {
            query: "python".into(),
            fallback: None,
            needed_by: crate::phase::NeededBy::Build,
        });
        let result = engine.resolve_weak_references();
        assert!(matches!(result, Err(Error::AmbiguousWeakReference { .. })));
    }
}
