//! Owner-scoped cache keys.
//!
//! Several sources may receive identical requests (two readers for different
//! datasets both see `VARIABLE=T;MEMBER=0;`). Scoping the key by the producing
//! source keeps their results apart in a shared cache.

use std::fmt;
use wxflow_core::{RequestKey, SourceId};

/// Separator between owner id and request in the encoded form.
const SEPARATOR: char = '/';

/// A cache key scoped to the source that produced the entry.
///
/// The private inner struct ensures an `OwnerScopedKey` can only be built
/// through [`OwnerScopedKey::new`], which requires the owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerScopedKey {
    inner: OwnerKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct OwnerKeyInner {
    owner: SourceId,
    request: RequestKey,
}

impl OwnerScopedKey {
    pub fn new(owner: SourceId, request: RequestKey) -> Self {
        Self {
            inner: OwnerKeyInner { owner, request },
        }
    }

    pub fn owner(&self) -> SourceId {
        self.inner.owner
    }

    pub fn request(&self) -> &RequestKey {
        &self.inner.request
    }

    /// Encode as `<owner>/<request>`.
    ///
    /// The owner id never contains the separator, so the first `/` always
    /// splits the two parts even if the request itself contains slashes.
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.inner.owner, SEPARATOR, self.inner.request)
    }

    /// Decode the form produced by [`encode`](Self::encode).
    ///
    /// Returns `None` if the separator is missing, the owner is not a valid
    /// id, or the request part is malformed.
    pub fn decode(s: &str) -> Option<Self> {
        let (owner, request) = s.split_once(SEPARATOR)?;
        let owner = owner.parse::<SourceId>().ok()?;
        let request = RequestKey::parse(request).ok()?;
        Some(Self::new(owner, request))
    }

    /// Prefix shared by all encoded keys of one owner.
    pub fn owner_prefix(owner: SourceId) -> String {
        format!("{}{}", owner, SEPARATOR)
    }

    pub fn belongs_to(&self, owner: SourceId) -> bool {
        self.inner.owner == owner
    }
}

impl fmt::Display for OwnerScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.inner.owner, SEPARATOR, self.inner.request)
    }
}
