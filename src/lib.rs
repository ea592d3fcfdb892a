//! envy: a content-addressed dependency resolution and build engine.
//!
//! A `Run` drives one or more recipe descriptors through a seven-phase
//! per-package state machine (spec_fetch, check, fetch, stage, build,
//! install, completion), caching each finished result under a content
//! address derived from its canonical identity, resolved options, and
//! resolved weak dependencies. The embedded scripting language that recipes
//! are written in is out of scope for this crate (see `recipe::RecipeLoader`
//! and `bundle::BundleManifestLoader`, the seams a host fills in).

pub mod archive;
pub mod bundle;
pub mod cache;
pub mod config;
pub mod contract;
pub mod descriptor;
pub mod error;
pub mod fs_util;
pub mod hash;
pub mod identity;
pub mod locking;
pub mod options;
pub mod package;
pub mod phase;
pub mod phases;
pub mod platform;
pub mod progress;
pub mod recipe;
pub mod registry;
pub mod shell;

pub use bundle::{BundleManifest, BundleManifestLoader, BundleRegistry};
pub use cache::{Cache, CacheAddress, CacheConfig};
pub use config::{Run, RunConfig};
pub use contract::{LocalTransport, PhaseContext, Transport};
pub use descriptor::{DescriptorPool, DescriptorRef, DescriptorSpec, RecipeDescriptor, RecipeSource};
pub use error::{Error, Result};
pub use hash::{cache_address_hash, sha256, Hash, HashAlgorithm};
pub use identity::{CanonicalKey, Identity};
pub use options::OptionValue;
pub use package::{Package, PackageKind};
pub use phase::{NeededBy, Phase};
pub use platform::{Arch, Platform};
pub use progress::{LogProgress, ProgressTracker, SilentProgress};
pub use recipe::{
    BuildVerb, CheckVerb, DependencyDeclaration, DependencySource, FetchItem, FetchVerb,
    FunctionOutcome, InstallVerb, RecipeLoader, RecipeScript, StageVerb,
};
pub use registry::Engine;
