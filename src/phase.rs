//! The seven ordered phases of the per-package state machine (spec §4.4)
//! and the `needed_by` phase names a dependency may declare (spec §6).
//!
//! Phases and `needed_by` labels share one ordinal scale (multiples of 10)
//! so that `import` can sit strictly between `check` and `fetch` without
//! being a phase the worker loop itself ever executes.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    SpecFetch,
    Check,
    Fetch,
    Stage,
    Build,
    Install,
    Completion,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::SpecFetch,
        Phase::Check,
        Phase::Fetch,
        Phase::Stage,
        Phase::Build,
        Phase::Install,
        Phase::Completion,
    ];

    /// Ordinal on the shared 10-per-phase scale.
    pub fn ordinal(self) -> u32 {
        match self {
            Phase::SpecFetch => 0,
            Phase::Check => 10,
            Phase::Fetch => 20,
            Phase::Stage => 30,
            Phase::Build => 40,
            Phase::Install => 50,
            Phase::Completion => 60,
        }
    }

    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::SpecFetch => Some(Phase::Check),
            Phase::Check => Some(Phase::Fetch),
            Phase::Fetch => Some(Phase::Stage),
            Phase::Stage => Some(Phase::Build),
            Phase::Build => Some(Phase::Install),
            Phase::Install => Some(Phase::Completion),
            Phase::Completion => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::SpecFetch => "spec_fetch",
            Phase::Check => "check",
            Phase::Fetch => "fetch",
            Phase::Stage => "stage",
            Phase::Build => "build",
            Phase::Install => "install",
            Phase::Completion => "completion",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The phase names a dependency's `needed_by` field may take (spec §6):
/// `check`, `import`, `fetch`, `stage`, `build` (default), `install`.
/// `import` is not a phase the worker loop executes; it is a gating point
/// strictly between `check` and `fetch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NeededBy {
    Check,
    Import,
    Fetch,
    Stage,
    Build,
    Install,
}

impl Default for NeededBy {
    fn default() -> Self {
        NeededBy::Build
    }
}

impl NeededBy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "check" => Ok(NeededBy::Check),
            "import" => Ok(NeededBy::Import),
            "fetch" => Ok(NeededBy::Fetch),
            "stage" => Ok(NeededBy::Stage),
            "build" => Ok(NeededBy::Build),
            "install" => Ok(NeededBy::Install),
            other => Err(Error::MalformedRecipe {
                path: None,
                reason: format!(
                    "invalid needed_by {other:?}; must be one of check, import, fetch, stage, build, install"
                ),
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NeededBy::Check => "check",
            NeededBy::Import => "import",
            NeededBy::Fetch => "fetch",
            NeededBy::Stage => "stage",
            NeededBy::Build => "build",
            NeededBy::Install => "install",
        }
    }

    fn ordinal(self) -> u32 {
        match self {
            NeededBy::Check => Phase::Check.ordinal(),
            NeededBy::Import => Phase::Check.ordinal() + 5,
            NeededBy::Fetch => Phase::Fetch.ordinal(),
            NeededBy::Stage => Phase::Stage.ordinal(),
            NeededBy::Build => Phase::Build.ordinal(),
            NeededBy::Install => Phase::Install.ordinal(),
        }
    }

    /// True when a parent about to execute `next` must have this
    /// dependency already at completion: "a dependency declared with
    /// `needed_by = P` must be at completion before the parent begins
    /// phase `P`" (spec §4.4).
    pub fn gates(self, next: Phase) -> bool {
        next.ordinal() >= self.ordinal()
    }
}

impl fmt::Display for NeededBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_sequence_is_monotonic() {
        let mut cur = Phase::SpecFetch;
        let mut count = 1;
        while let Some(next) = cur.next() {
            assert!(next.ordinal() > cur.ordinal());
            cur = next;
            count += 1;
        }
        assert_eq!(count, 7);
    }

    #[test]
    fn import_sits_between_check_and_fetch() {
        assert!(NeededBy::Check.ordinal() < NeededBy::Import.ordinal());
        assert!(NeededBy::Import.ordinal() < NeededBy::Fetch.ordinal());
    }

    #[test]
    fn default_needed_by_is_build() {
        assert_eq!(NeededBy::default(), NeededBy::Build);
    }

    #[test]
    fn gating_rule() {
        // needed_by=build gates before the parent's build phase, not before stage.
        assert!(!NeededBy::Build.gates(Phase::Stage));
        assert!(NeededBy::Build.gates(Phase::Build));
        assert!(NeededBy::Build.gates(Phase::Install));
    }

    #[test]
    fn check_needed_by_allows_dependency_before_parent_check() {
        // "needed_by = check" permits a dependency to be completed before
        // the parent's own check runs (spec §8 boundary behavior).
        assert!(NeededBy::Check.gates(Phase::Check));
    }

    #[test]
    fn parse_rejects_unknown_names() {
        assert!(NeededBy::parse("bogus").is_err());
    }
}
