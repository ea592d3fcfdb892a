//! The parsed shape of a recipe script (spec §6 "Spec-level globals") and
//! the loader seam that turns a resolved recipe path into one.
//!
//! The embedded scripting language itself is out of scope (spec §1); what
//! this crate owns is the *shape* a loaded recipe takes once parsed, and
//! the tagged-variant dispatch over FETCH/STAGE/BUILD/INSTALL the phase
//! implementations match on (spec §9 Design Notes: "encode as a tagged
//! variant ... do not use inheritance").

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::options::OptionValue;
use crate::phase::NeededBy;

/// One entry of a declarative `fetch` table or array: `{source, sha256?}`.
/// Git sources are not expressed here: a git-cloned recipe is declared via
/// the descriptor's own `RecipeSource::Git`, which invalidates the fetch
/// marker outright rather than participating in the declarative fetch list
/// (spec §4.3: "git clones invalidate the fetch marker").
#[derive(Debug, Clone)]
pub struct FetchItem {
    pub source: String,
    pub sha256: Option<String>,
}

/// What a phase function may hand back after running: nothing further,
/// a shell script to run next (build/install functions returning a
/// string), or — fetch functions only — an additional declarative fetch
/// spec to process on top of whatever the function itself fetched.
pub enum FunctionOutcome {
    None,
    RunShell(String),
    Declarative(Vec<FetchItem>),
}

pub type PhaseFn = Arc<dyn Fn(&crate::contract::PhaseContext) -> Result<FunctionOutcome> + Send + Sync>;

pub enum CheckVerb {
    Shell(String),
    Function(Arc<dyn Fn(&OptionValue) -> Result<bool> + Send + Sync>),
}

#[derive(Default)]
pub enum FetchVerb {
    #[default]
    Nil,
    Declarative(Vec<FetchItem>),
    Function(PhaseFn),
}

#[derive(Default)]
pub enum StageVerb {
    #[default]
    Nil,
    Shell(String),
    Table {
        strip: u32,
    },
    Function(PhaseFn),
}

#[derive(Default)]
pub enum BuildVerb {
    #[default]
    Nil,
    Shell(String),
    Function(PhaseFn),
}

#[derive(Default)]
pub enum InstallVerb {
    #[default]
    Nil,
    Shell(String),
    Function(PhaseFn),
}

/// One declared dependency, in the raw shape a loaded recipe expresses it
/// (spec §6): turned into a full descriptor + package by the spec-fetch
/// phase implementation (C7), which owns cycle checking and registry
/// wiring.
pub struct DependencyDeclaration {
    pub identity: Option<String>,
    pub source: Option<DependencySource>,
    pub options: OptionValue,
    pub needed_by: Option<String>,
    pub product: Option<String>,
    pub weak_fallback: Option<Box<DependencyDeclaration>>,
}

pub enum DependencySource {
    UrlOrPath { value: String, sha256: Option<String> },
    Git { url: String, git_ref: String },
    Custom { dependencies: Vec<DependencyDeclaration>, fetch: PhaseFn },
}

/// A fully-loaded recipe (spec §6 spec-level globals), as produced by a
/// `RecipeLoader`.
pub struct RecipeScript {
    pub identity: String,
    pub dependencies: Vec<DependencyDeclaration>,
    pub products: std::collections::HashMap<String, String>,
    pub check: Option<CheckVerb>,
    pub fetch: FetchVerb,
    pub stage: StageVerb,
    pub build: BuildVerb,
    pub install: InstallVerb,
    pub default_shell: Option<crate::shell::Shell>,
    pub needed_by: Option<NeededBy>,
}

impl RecipeScript {
    pub fn is_user_managed(&self) -> bool {
        self.check.is_some()
    }

    /// "Validate that either a fetch verb exists or both check and install
    /// verbs exist" (spec §4.7 phase 0).
    pub fn validate_shape(&self) -> Result<()> {
        let has_fetch_pipeline = !matches!(self.fetch, FetchVerb::Nil)
            || !matches!(self.stage, StageVerb::Nil)
            || !matches!(self.build, BuildVerb::Nil)
            || !matches!(self.install, InstallVerb::Nil);
        let has_check_and_install = self.check.is_some() && !matches!(self.install, InstallVerb::Nil);

        if self.check.is_some() {
            if matches!(self.install, InstallVerb::Nil) {
                return Err(crate::error::Error::MalformedRecipe {
                    path: None,
                    reason: format!("{}: INSTALL is required when CHECK is present", self.identity),
                });
            }
            if !matches!(self.fetch, FetchVerb::Nil)
                || !matches!(self.stage, StageVerb::Nil)
                || !matches!(self.build, BuildVerb::Nil)
            {
                return Err(crate::error::Error::MalformedRecipe {
                    path: None,
                    reason: format!(
                        "{}: user-managed package may not declare fetch/stage/build phases",
                        self.identity
                    ),
                });
            }
            return Ok(());
        }

        if !has_fetch_pipeline && !has_check_and_install {
            return Err(crate::error::Error::MalformedRecipe {
                path: None,
                reason: format!(
                    "{}: a recipe must declare a fetch/stage/build pipeline or a check+install pair",
                    self.identity
                ),
            });
        }
        Ok(())
    }
}

/// Resolves a recipe source to an on-disk path and parses the script there.
/// The embedded scripting runtime and URI classification live outside this
/// crate (spec §1); this trait is the seam a host application fills in.
pub trait RecipeLoader: Send + Sync {
    fn load(&self, resolved_path: &Path, expected_identity: &str) -> Result<RecipeScript>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(identity: &str) -> RecipeScript {
        RecipeScript {
            identity: identity.to_string(),
            dependencies: vec![],
            products: Default::default(),
            check: None,
            fetch: FetchVerb::Nil,
            stage: StageVerb::Nil,
            build: BuildVerb::Nil,
            install: InstallVerb::Nil,
            default_shell: None,
            needed_by: None,
        }
    }

    #[test]
    fn rejects_recipe_with_no_verbs() {
        let script = minimal("foo.hello@v1");
        assert!(script.validate_shape().is_err());
    }

    #[test]
    fn accepts_fetch_only_pipeline() {
        let mut script = minimal("foo.hello@v1");
        script.fetch = FetchVerb::Declarative(vec![]);
        assert!(script.validate_shape().is_ok());
    }

    #[test]
    fn check_requires_install() {
        let mut script = minimal("local.brew@r0");
        script.check = Some(CheckVerb::Shell("test -f /opt/brew/bin/brew".into()));
        assert!(script.validate_shape().is_err());
        script.install = InstallVerb::Shell("echo installing".into());
        assert!(script.validate_shape().is_ok());
    }

    #[test]
    fn check_rejects_cache_managed_phases() {
        let mut script = minimal("local.brew@r0");
        script.check = Some(CheckVerb::Shell("test -f x".into()));
        script.install = InstallVerb::Shell("echo x".into());
        script.build = BuildVerb::Shell("make".into());
        assert!(script.validate_shape().is_err());
    }
}
