//! Recipe descriptor and the process-wide descriptor pool (component C2).
//!
//! A descriptor is immutable once constructed. The pool hands back a
//! `DescriptorRef` (an `Arc`) stable for the process lifetime; repeated
//! parsing of structurally equal recipes may legitimately produce distinct
//! descriptors — only the *package*, keyed by canonical key in the engine
//! registry, must be deduplicated.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::options::OptionValue;
use crate::phase::NeededBy;

pub type DescriptorRef = Arc<RecipeDescriptor>;

/// Where a recipe's source material comes from (spec §3 `source`).
#[derive(Debug, Clone)]
pub enum RecipeSource {
    Remote {
        url: String,
        sha256: Option<String>,
    },
    Local {
        path: PathBuf,
    },
    Git {
        url: String,
        git_ref: String,
    },
    /// Recipe supplies its own fetch via a script-level `fetch` function,
    /// run in the parent's script state with dependencies pre-resolved.
    FetchFunction {
        source_dependencies: Vec<DescriptorRef>,
    },
    Bundle {
        bundle_identity: String,
        underlying_fetch_source: Box<RecipeSource>,
    },
    /// A weak reference carries no source of its own; it is resolved
    /// against the live graph (see `registry::resolve_weak_references`).
    WeakRef,
}

/// Immutable, interned recipe metadata (spec §3 "Recipe descriptor").
#[derive(Debug)]
pub struct RecipeDescriptor {
    pub identity: Identity,
    pub source: RecipeSource,
    pub serialized_options: String,
    pub needed_by: NeededBy,
    /// Weak back-link to the declaring recipe's descriptor, used only for
    /// error-context chains (spec §9): index into the pool rather than a
    /// strong reference, so no descriptor keeps its parent alive.
    pub parent: Option<std::sync::Weak<RecipeDescriptor>>,
    /// Present when this descriptor is itself a weak reference: the
    /// fallback descriptor to adopt if live resolution finds nothing.
    pub weak_fallback: Option<DescriptorRef>,
    pub product: Option<String>,
    pub declaring_file_path: Option<PathBuf>,
    pub bundle_identity: Option<String>,
}

impl RecipeDescriptor {
    pub fn is_weak_reference(&self) -> bool {
        matches!(self.source, RecipeSource::WeakRef)
    }
}

/// Construction parameters for a new descriptor; mirrors the wire fields of
/// spec §6 before they are validated and frozen into a `RecipeDescriptor`.
pub struct DescriptorSpec {
    pub identity: String,
    pub source: Option<RecipeSource>,
    pub options: OptionValue,
    pub needed_by: Option<String>,
    pub parent: Option<std::sync::Weak<RecipeDescriptor>>,
    pub weak_fallback: Option<DescriptorRef>,
    pub product: Option<String>,
    pub declaring_file_path: Option<PathBuf>,
    pub bundle_identity: Option<String>,
}

/// Process-wide interning store for recipe descriptors (spec §4.2).
#[derive(Default)]
pub struct DescriptorPool {
    descriptors: Mutex<Vec<DescriptorRef>>,
}

impl DescriptorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a descriptor spec, returning a pool-owned,
    /// process-lifetime-stable reference.
    ///
    /// Parsing rules (spec §4.2): `source` is mandatory unless the
    /// descriptor is a product-only weak reference; exactly one of
    /// `source`/`weak` is allowed; `needed_by` must name a known phase;
    /// options must not contain functions; `product` when present must be
    /// non-empty; nested weak fallbacks are not permitted; a non-`local.*`
    /// recipe may not declare a `local.*` dependency.
    pub fn emplace(&self, spec: DescriptorSpec) -> Result<DescriptorRef> {
        let identity = Identity::parse(&spec.identity)?;

        if let Some(parent) = &spec.parent {
            if let Some(parent) = parent.upgrade() {
                if !parent.identity.is_local() && identity.is_local() {
                    return Err(Error::MalformedRecipe {
                        path: spec.declaring_file_path.clone(),
                        reason: format!(
                            "non-local recipe {} may not declare local.* dependency {}",
                            parent.identity, identity
                        ),
                    });
                }
            }
        }

        let is_weak_only = spec.source.is_none() && spec.product.is_some();
        let source = match (spec.source, is_weak_only) {
            (Some(s), _) => s,
            (None, true) => RecipeSource::WeakRef,
            (None, false) => {
                return Err(Error::MalformedRecipe {
                    path: spec.declaring_file_path.clone(),
                    reason: format!("{identity}: source is mandatory unless product-only weak reference"),
                });
            }
        };

        if matches!(source, RecipeSource::WeakRef) {
            if let Some(fallback) = &spec.weak_fallback {
                if fallback.is_weak_reference() {
                    return Err(Error::MalformedRecipe {
                        path: spec.declaring_file_path.clone(),
                        reason: "nested weak fallbacks are not permitted".into(),
                    });
                }
            }
        } else if spec.weak_fallback.is_some() {
            return Err(Error::MalformedRecipe {
                path: spec.declaring_file_path.clone(),
                reason: "exactly one of source/weak is allowed".into(),
            });
        }

        if let Some(product) = &spec.product {
            if product.is_empty() {
                return Err(Error::MalformedRecipe {
                    path: spec.declaring_file_path.clone(),
                    reason: "product name must be non-empty".into(),
                });
            }
        }

        let needed_by = match spec.needed_by {
            Some(s) => NeededBy::parse(&s)?,
            None => NeededBy::default(),
        };

        let serialized_options = crate::options::serialize(&spec.options)?;

        let descriptor = Arc::new(RecipeDescriptor {
            identity,
            source,
            serialized_options,
            needed_by,
            parent: spec.parent,
            weak_fallback: spec.weak_fallback,
            product: spec.product,
            declaring_file_path: spec.declaring_file_path,
            bundle_identity: spec.bundle_identity,
        });

        self.descriptors
            .lock()
            .expect("descriptor pool poisoned")
            .push(descriptor.clone());

        Ok(descriptor)
    }

    pub fn len(&self) -> usize {
        self.descriptors.lock().expect("descriptor pool poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn empty_options() -> OptionValue {
        OptionValue::Table(BTreeMap::new())
    }

    #[test]
    fn emplace_basic_remote_descriptor() {
        let pool = DescriptorPool::new();
        let desc = pool
            .emplace(DescriptorSpec {
                identity: "foo.hello@v1".into(),
                source: Some(RecipeSource::Remote {
                    url: "https://example.com/hello.tar.gz".into(),
                    sha256: None,
                }),
                options: empty_options(),
                needed_by: None,
                parent: None,
                weak_fallback: None,
                product: None,
                declaring_file_path: None,
                bundle_identity: None,
            })
            .unwrap();
        assert_eq!(desc.identity.as_str(), "foo.hello@v1");
        assert_eq!(desc.needed_by, NeededBy::Build);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn missing_source_without_product_is_error() {
        let pool = DescriptorPool::new();
        let result = pool.emplace(DescriptorSpec {
            identity: "foo.hello@v1".into(),
            source: None,
            options: empty_options(),
            needed_by: None,
            parent: None,
            weak_fallback: None,
            product: None,
            declaring_file_path: None,
            bundle_identity: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn product_only_weak_reference_is_allowed() {
        let pool = DescriptorPool::new();
        let desc = pool
            .emplace(DescriptorSpec {
                identity: "foo.python@r1".into(),
                source: None,
                options: empty_options(),
                needed_by: None,
                parent: None,
                weak_fallback: None,
                product: Some("python".into()),
                declaring_file_path: None,
                bundle_identity: None,
            })
            .unwrap();
        assert!(desc.is_weak_reference());
    }

    #[test]
    fn local_namespace_rule_enforced() {
        let pool = DescriptorPool::new();
        let parent = pool
            .emplace(DescriptorSpec {
                identity: "vendor.app@v1".into(),
                source: Some(RecipeSource::Local { path: "/tmp".into() }),
                options: empty_options(),
                needed_by: None,
                parent: None,
                weak_fallback: None,
                product: None,
                declaring_file_path: None,
                bundle_identity: None,
            })
            .unwrap();
        let result = pool.emplace(DescriptorSpec {
            identity: "local.brew@r0".into(),
            source: Some(RecipeSource::Local { path: "/opt".into() }),
            options: empty_options(),
            needed_by: None,
            parent: Some(Arc::downgrade(&parent)),
            weak_fallback: None,
            product: None,
            declaring_file_path: None,
            bundle_identity: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn empty_product_name_rejected() {
        let pool = DescriptorPool::new();
        let result = pool.emplace(DescriptorSpec {
            identity: "foo.python@r1".into(),
            source: None,
            options: empty_options(),
            needed_by: None,
            parent: None,
            weak_fallback: None,
            product: Some(String::new()),
            declaring_file_path: None,
            bundle_identity: None,
        });
        assert!(result.is_err());
    }
}
