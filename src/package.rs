//! Package runtime state and the per-package worker thread (component C4).
//!
//! A `Package` pairs an immutable descriptor with mutable execution state:
//! dependency wiring, resolved products, the cache lock held between a
//! check-phase miss and install completion, and the execution context the
//! worker loop drives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, error, info};

use crate::cache::ScopedEntryLock;
use crate::descriptor::DescriptorRef;
use crate::error::{Error, Result};
use crate::identity::CanonicalKey;
use crate::phase::{NeededBy, Phase};
use crate::progress::{ProgressTracker, SilentProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    CacheManaged,
    UserManaged,
    Unknown,
}

/// A single declared dependency edge: the package it resolves to and the
/// phase by which it must have reached completion.
#[derive(Clone)]
pub struct DependencyInfo {
    pub package: Arc<Package>,
    pub needed_by: NeededBy,
}

#[derive(Clone)]
pub struct ProductDependencyInfo {
    pub needed_by: NeededBy,
    pub provider: Arc<Package>,
    /// Optional identity constraint the provider must satisfy.
    pub constraint_identity: Option<String>,
}

/// An unresolved weak reference awaiting `registry::resolve_weak_references`.
pub struct WeakReference {
    pub query: String,
    pub fallback: Option<DescriptorRef>,
    pub needed_by: NeededBy,
}

/// Per-package execution state (spec §3 "Execution context").
pub struct ExecutionContext {
    pub current_phase: AtomicU32,
    pub target_phase: AtomicU32,
    pub failed: AtomicBool,
    pub started: AtomicBool,
    pub error_message: Mutex<Option<String>>,
    pub ancestor_chain: Vec<String>,
    worker_spawned: AtomicBool,
    mutex: Mutex<()>,
    cv: Condvar,
}

impl ExecutionContext {
    pub fn new(ancestor_chain: Vec<String>) -> Self {
        ExecutionContext {
            current_phase: AtomicU32::new(0),
            target_phase: AtomicU32::new(0),
            failed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            error_message: Mutex::new(None),
            ancestor_chain,
            worker_spawned: AtomicBool::new(false),
            mutex: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Claim the right to spawn this package's worker thread. Returns
    /// `true` exactly once across however many callers race to discover
    /// the same package (spec_fetch dependency registration and
    /// post-resolution fallback sweep both call this).
    pub fn try_claim_worker(&self) -> bool {
        self.worker_spawned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn current_phase(&self) -> Option<Phase> {
        ordinal_to_phase(self.current_phase.load(Ordering::SeqCst))
    }

    fn target_ordinal(&self) -> u32 {
        self.target_phase.load(Ordering::SeqCst)
    }

    /// CAS loop installing a strictly greater target; a lower target is a
    /// no-op. Signals the worker's condvar on success.
    pub fn set_target_phase(&self, target: Phase) {
        let target_ord = target.ordinal();
        loop {
            let current = self.target_phase.load(Ordering::SeqCst);
            if target_ord <= current {
                return;
            }
            if self
                .target_phase
                .compare_exchange(current, target_ord, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let _guard = self.mutex.lock().expect("exec ctx mutex poisoned");
                self.cv.notify_all();
                return;
            }
        }
    }

    /// Block until `target_phase > current_phase`.
    fn wait_for_target(&self) {
        let guard = self.mutex.lock().expect("exec ctx mutex poisoned");
        let _unused = self
            .cv
            .wait_while(guard, |_| {
                self.target_phase.load(Ordering::SeqCst)
                    <= self.current_phase.load(Ordering::SeqCst)
            })
            .expect("exec ctx mutex poisoned");
    }

    fn advance_to(&self, phase: Phase) {
        self.current_phase.store(phase.ordinal(), Ordering::SeqCst);
        let _guard = self.mutex.lock().expect("exec ctx mutex poisoned");
        self.cv.notify_all();
    }

    pub fn mark_failed(&self, message: String) {
        *self.error_message.lock().expect("exec ctx mutex poisoned") = Some(message);
        self.failed.store(true, Ordering::SeqCst);
        let _guard = self.mutex.lock().expect("exec ctx mutex poisoned");
        self.cv.notify_all();
    }

    /// Block until this context reaches `completion` or `failed` is set.
    pub fn wait_for_completion(&self) -> Result<()> {
        let guard = self.mutex.lock().expect("exec ctx mutex poisoned");
        let _unused = self
            .cv
            .wait_while(guard, |_| {
                !self.failed.load(Ordering::SeqCst)
                    && self.current_phase.load(Ordering::SeqCst) < Phase::Completion.ordinal()
            })
            .expect("exec ctx mutex poisoned");
        if self.failed.load(Ordering::SeqCst) {
            let msg = self
                .error_message
                .lock()
                .expect("exec ctx mutex poisoned")
                .clone()
                .unwrap_or_else(|| "dependency failed".to_string());
            return Err(Error::DependencyNotReady {
                identity: String::new(),
                needed_by: msg,
                current: "failed".into(),
            });
        }
        Ok(())
    }
}

fn ordinal_to_phase(ordinal: u32) -> Option<Phase> {
    Phase::ALL.into_iter().find(|p| p.ordinal() == ordinal)
}

/// Runtime package state wrapping an immutable descriptor (spec §3
/// "Package"), one per unique canonical key.
pub struct Package {
    pub key: CanonicalKey,
    pub descriptor: DescriptorRef,
    pub exec_ctx: ExecutionContext,
    pub kind: Mutex<PackageKind>,
    pub canonical_identity_hash: Mutex<Option<String>>,
    pub pkg_path: Mutex<Option<std::path::PathBuf>>,
    pub result_hash: Mutex<Option<String>>,
    pub declared_dependencies: Mutex<Vec<String>>,
    pub dependencies: Mutex<HashMap<String, DependencyInfo>>,
    pub product_dependencies: Mutex<HashMap<String, ProductDependencyInfo>>,
    pub weak_references: Mutex<Vec<WeakReference>>,
    pub products: Mutex<HashMap<String, String>>,
    pub resolved_weak_dependency_keys: Mutex<Vec<String>>,
    pub entry_lock: Mutex<Option<ScopedEntryLock>>,
    pub progress: Mutex<Box<dyn ProgressTracker>>,
    pub recipe: Mutex<Option<crate::recipe::RecipeScript>>,
    /// Set by the install phase (spec §4.7 phase 5): whether completion
    /// should write the `envy-install-complete` marker.
    pub install_should_complete: Mutex<bool>,
}

impl Package {
    pub fn new(key: CanonicalKey, descriptor: DescriptorRef, ancestor_chain: Vec<String>) -> Self {
        Package {
            key,
            descriptor,
            exec_ctx: ExecutionContext::new(ancestor_chain),
            kind: Mutex::new(PackageKind::Unknown),
            canonical_identity_hash: Mutex::new(None),
            pkg_path: Mutex::new(None),
            result_hash: Mutex::new(None),
            declared_dependencies: Mutex::new(Vec::new()),
            dependencies: Mutex::new(HashMap::new()),
            product_dependencies: Mutex::new(HashMap::new()),
            weak_references: Mutex::new(Vec::new()),
            products: Mutex::new(HashMap::new()),
            resolved_weak_dependency_keys: Mutex::new(Vec::new()),
            entry_lock: Mutex::new(None),
            progress: Mutex::new(Box::new(SilentProgress::new())),
            recipe: Mutex::new(None),
            install_should_complete: Mutex::new(true),
        }
    }

    pub fn identity(&self) -> &str {
        self.descriptor.identity.as_str()
    }

    /// Record the full cache-address digest (spec §3 `canonical_identity_hash`:
    /// the 64-hex-char BLAKE3 digest this package's cache directory segment
    /// is derived from), computed once weak dependencies are resolved.
    pub fn set_canonical_identity_hash(&self, hash: &str) {
        *self.canonical_identity_hash.lock().expect("poisoned") = Some(hash.to_string());
    }

    /// Check for a dependency cycle before spawning a child: the cycle
    /// exists if the child's identity equals the current identity or
    /// appears in the ancestor chain (spec §4.4).
    pub fn check_cycle(&self, child_identity: &str) -> Result<()> {
        if self.identity() == child_identity || self.exec_ctx.ancestor_chain.iter().any(|a| a == child_identity) {
            let mut chain: Vec<String> = self.exec_ctx.ancestor_chain.clone();
            chain.push(self.identity().to_string());
            chain.push(child_identity.to_string());
            return Err(Error::DependencyCycle { chain });
        }
        Ok(())
    }

    pub fn child_ancestor_chain(&self) -> Vec<String> {
        let mut chain = self.exec_ctx.ancestor_chain.clone();
        chain.push(self.identity().to_string());
        chain
    }

    /// Wait for every declared dependency whose `needed_by` gates `next`
    /// to reach completion before the worker runs `phase[next]` (spec §4.4
    /// worker loop pseudocode).
    pub fn wait_for_gating_dependencies(&self, next: Phase) -> Result<()> {
        let deps: Vec<DependencyInfo> = self
            .dependencies
            .lock()
            .expect("package mutex poisoned")
            .values()
            .cloned()
            .collect();
        for dep in deps {
            if dep.needed_by.gates(next) {
                debug!(
                    parent = self.identity(),
                    dependency = dep.package.identity(),
                    phase = %next,
                    "waiting for gating dependency"
                );
                if let Err(e) = dep.package.exec_ctx.wait_for_completion() {
                    // Preserve the dependency's actual failure reason (e.g. a
                    // cycle chain) rather than replacing it with a generic
                    // message; `wait_for_completion` always carries it in
                    // `needed_by` when it fails.
                    let reason = match e {
                        Error::DependencyNotReady { needed_by, .. } => needed_by,
                        other => other.to_string(),
                    };
                    return Err(Error::DependencyNotReady {
                        identity: dep.package.identity().to_string(),
                        needed_by: reason,
                        current: next.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// The per-package worker loop (spec §4.4): advance one phase at a
    /// time as `target_phase` permits, gating on dependencies, invoking
    /// `run_phase` for the transition, and stopping at `completion` or on
    /// failure.
    pub fn run_worker_loop(
        self: &Arc<Self>,
        run_phase: impl Fn(&Arc<Package>, Phase) -> Result<()>,
    ) {
        loop {
            self.exec_ctx.wait_for_target();
            if self.exec_ctx.failed.load(Ordering::SeqCst) {
                return;
            }
            let current = self
                .exec_ctx
                .current_phase()
                .unwrap_or(Phase::SpecFetch);
            let Some(next) = (if self.exec_ctx.started.swap(true, Ordering::SeqCst) {
                current.next()
            } else {
                Some(Phase::SpecFetch)
            }) else {
                return;
            };

            if let Err(e) = self.wait_for_gating_dependencies(next) {
                error!(identity = self.identity(), error = %e, "dependency wait failed");
                self.exec_ctx.mark_failed(e.to_string());
                return;
            }

            if let Err(e) = run_phase(self, next) {
                error!(identity = self.identity(), phase = %next, error = %e, "phase failed");
                self.exec_ctx.mark_failed(e.to_string());
                return;
            }

            self.exec_ctx.advance_to(next);
            info!(identity = self.identity(), phase = %next, "phase complete");
            if next == Phase::Completion {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorPool, DescriptorSpec, RecipeSource};
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    fn make_package(identity: &str) -> Arc<Package> {
        let pool = DescriptorPool::new();
        let descriptor = pool
            .emplace(DescriptorSpec {
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
            .unwrap();
        let key = CanonicalKey::from_identity_only(&descriptor.identity);
        Arc::new(Package::new(key, descriptor, vec![]))
    }

    #[test]
    fn target_promotion_is_monotonic() {
        let pkg = make_package("foo.hello@v1");
        pkg.exec_ctx.set_target_phase(Phase::Build);
        assert_eq!(pkg.exec_ctx.target_ordinal(), Phase::Build.ordinal());
        pkg.exec_ctx.set_target_phase(Phase::Check);
        assert_eq!(
            pkg.exec_ctx.target_ordinal(),
            Phase::Build.ordinal(),
            "lower target must be a no-op"
        );
        pkg.exec_ctx.set_target_phase(Phase::Completion);
        assert_eq!(pkg.exec_ctx.target_ordinal(), Phase::Completion.ordinal());
    }

    #[test]
    fn cycle_detection_self_reference() {
        let pkg = make_package("a.pkg@v1");
        assert!(pkg.check_cycle("a.pkg@v1").is_err());
        assert!(pkg.check_cycle("b.pkg@v1").is_ok());
    }

    #[test]
    fn cycle_detection_via_ancestor_chain() {
        let pool = DescriptorPool::new();
        let descriptor = pool
            .emplace(DescriptorSpec {
                identity: "b.pkg@v1".into(),
                source: Some(RecipeSource::Local { path: "/tmp".into() }),
                options: crate::options::OptionValue::Table(BTreeMap::new()),
                needed_by: None,
                parent: None,
                weak_fallback: None,
                product: None,
                declaring_file_path: None,
                bundle_identity: None,
            })
            .unwrap();
        let key = CanonicalKey::from_identity_only(&descriptor.identity);
        let pkg = Package::new(key, descriptor, vec!["a.pkg@v1".to_string()]);
        let err = pkg.check_cycle("a.pkg@v1").unwrap_err();
        match err {
            Error::DependencyCycle { chain } => {
                assert_eq!(chain, vec!["a.pkg@v1", "b.pkg@v1", "a.pkg@v1"]);
            }
            _ => panic!("expected DependencyCycle"),
        }
    }

    #[test]
    fn worker_loop_runs_all_phases_to_completion() {
        let pkg = make_package("foo.hello@v1");
        pkg.exec_ctx.set_target_phase(Phase::Completion);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        pkg.run_worker_loop(move |_p, phase| {
            seen2.lock().unwrap().push(phase);
            Ok(())
        });
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 7);
        assert_eq!(*seen.last().unwrap(), Phase::Completion);
        assert_eq!(
            pkg.exec_ctx.current_phase.load(Ordering::SeqCst),
            Phase::Completion.ordinal()
        );
    }

    #[test]
    fn worker_loop_stops_on_failure() {
        let pkg = make_package("foo.hello@v1");
        pkg.exec_ctx.set_target_phase(Phase::Completion);
        pkg.run_worker_loop(|_p, phase| {
            if phase == Phase::Fetch {
                Err(Error::ShellFailure {
                    command: "x".into(),
                    exit_code: Some(1),
                    signal: None,
                    stdout: None,
                    stderr: None,
                })
            } else {
                Ok(())
            }
        });
        assert!(pkg.exec_ctx.failed.load(Ordering::SeqCst));
    }
}
