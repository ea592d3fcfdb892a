//! Identity parsing and canonical keying (component C1).
//!
//! An identity is `namespace.name@revision`. The canonical key appends a
//! deterministic serialization of the recipe's option table. Canonical keys
//! are the single source of truth for both on-disk cache addressing and
//! in-memory package deduplication; any drift between the two keyings is a
//! correctness bug, not a style choice.

use std::fmt;

use crate::error::{Error, Result};
use crate::options::OptionValue;

/// A parsed `namespace.name@revision` string. Cheap to clone; stores the
/// three components plus the original text so `Display` round-trips exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    text: String,
    namespace_end: usize,
    name_end: usize,
}

impl Identity {
    /// Parse and validate an identity string. All three components
    /// (namespace, name, revision) must be non-empty.
    pub fn parse(text: &str) -> Result<Self> {
        let dot = text.find('.').ok_or_else(|| Error::MalformedIdentity {
            identity: text.to_string(),
            reason: "missing '.' separating namespace from name".into(),
        })?;
        let at = text.find('@').ok_or_else(|| Error::MalformedIdentity {
            identity: text.to_string(),
            reason: "missing '@' separating name from revision".into(),
        })?;
        if at <= dot {
            return Err(Error::MalformedIdentity {
                identity: text.to_string(),
                reason: "'@' must come after '.'".into(),
            });
        }
        if dot == 0 {
            return Err(Error::MalformedIdentity {
                identity: text.to_string(),
                reason: "namespace is empty".into(),
            });
        }
        if at - dot == 1 {
            return Err(Error::MalformedIdentity {
                identity: text.to_string(),
                reason: "name is empty".into(),
            });
        }
        if at + 1 == text.len() {
            return Err(Error::MalformedIdentity {
                identity: text.to_string(),
                reason: "revision is empty".into(),
            });
        }
        Ok(Identity {
            text: text.to_string(),
            namespace_end: dot,
            name_end: at,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.text[..self.namespace_end]
    }

    pub fn name(&self) -> &str {
        &self.text[self.namespace_end + 1..self.name_end]
    }

    pub fn revision(&self) -> &str {
        &self.text[self.name_end + 1..]
    }

    /// `namespace.name` without the revision.
    pub fn namespace_name(&self) -> &str {
        &self.text[..self.name_end]
    }

    /// `name@revision` without the namespace.
    pub fn name_revision(&self) -> &str {
        &self.text[self.namespace_end + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// `local.*` is a privileged namespace: non-local recipes may not
    /// declare a dependency in it.
    pub fn is_local(&self) -> bool {
        self.namespace() == "local"
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Identity plus serialized options: the dedup key for the engine registry
/// and the input to the cache-address hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    /// Build the canonical key from an identity and an options table.
    /// Options serialize via the deterministic Lua-table-literal form
    /// defined in `options.rs`; an empty table serializes to nothing
    /// appended (canonical key equals the identity).
    pub fn canonicalize(identity: &Identity, options: &OptionValue) -> Result<Self> {
        let serialized = crate::options::serialize(options)?;
        if serialized == "{}" {
            Ok(CanonicalKey(identity.as_str().to_string()))
        } else {
            Ok(CanonicalKey(format!("{identity}{serialized}")))
        }
    }

    pub fn from_identity_only(identity: &Identity) -> Self {
        CanonicalKey(identity.as_str().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identity portion of the canonical key (everything before the
    /// optional `{...}` suffix).
    pub fn identity_part(&self) -> &str {
        match self.0.find('{') {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// The five-way fuzzy match rule: full canonical, identity alone,
    /// `name` alone, `namespace.name`, or `name@revision`.
    pub fn matches(&self, query: &str) -> bool {
        if self.0 == query {
            return true;
        }
        let Ok(id) = Identity::parse(self.identity_part()) else {
            return false;
        };
        query == id.as_str()
            || query == id.name()
            || query == id.namespace_name()
            || query == id.name_revision()
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
