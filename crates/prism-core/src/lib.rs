//! Core shared types for Prism.
//!
//! This crate is deliberately tiny and free of dependencies: it defines the
//! feature vocabulary (ids, names, the registry) that every other Prism crate
//! speaks, and nothing else.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// Compact, stable handle for a registered feature.
///
/// Ids are assigned densely by [`FeatureSet`] in declaration order and are
/// never reused within one set. A `FeatureId` is only meaningful together
/// with the set (or session) it was issued by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureId(u32);

impl FeatureId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn to_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Declared name of a feature, e.g. `"glcm.contrast"`.
///
/// Names are plain UTF-8 strings; Prism attaches no structure to them beyond
/// the scope prefixes stripped during identifier resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureName(String);

impl FeatureName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeatureName {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for FeatureName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl AsRef<str> for FeatureName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Allows `HashMap<FeatureName, _>` lookups with a plain `&str` key. Sound
// because the derived `Eq`/`Hash`/`Ord` of a one-field newtype agree with
// `str`'s.
impl Borrow<str> for FeatureName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A unit of computation whose scalar result can be cached.
///
/// The evaluation logic lives outside Prism; a `Feature` is just the identity
/// the cache keys on. Named features are memoized, anonymous ones (no name)
/// are evaluated every time they are requested.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Feature {
    id: FeatureId,
    name: Option<FeatureName>,
}

impl Feature {
    pub fn new(id: FeatureId, name: Option<FeatureName>) -> Self {
        Self { id, name }
    }

    #[inline]
    pub fn id(&self) -> FeatureId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> Option<&FeatureName> {
        self.name.as_ref()
    }

    #[inline]
    pub fn is_named(&self) -> bool {
        self.name.is_some()
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => f.write_str(name.as_str()),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Maps a string identifier to a feature.
///
/// Implemented by [`FeatureSet`]; pipelines with their own catalogs can
/// implement it directly. `resolve` receives identifiers with scope prefixes
/// already stripped and should return `None` for unknown names.
pub trait FeatureLookup {
    fn resolve(&self, identifier: &str) -> Option<Feature>;
}

/// Error returned by [`FeatureSet::declare`] when a name is already taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateFeatureName {
    name: FeatureName,
}

impl DuplicateFeatureName {
    pub fn name(&self) -> &FeatureName {
        &self.name
    }
}

impl fmt::Display for DuplicateFeatureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "feature name `{}` is already declared", self.name)
    }
}

impl Error for DuplicateFeatureName {}

/// Registry of features known to a pipeline.
///
/// Issues [`FeatureId`]s in declaration order and keeps the name index used
/// for identifier resolution. Declaring is infallible except for duplicate
/// names, which are rejected rather than silently shadowed.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    features: Vec<Feature>,
    by_name: HashMap<FeatureName, FeatureId>,
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a named feature and returns its handle.
    pub fn declare(
        &mut self,
        name: impl Into<FeatureName>,
    ) -> Result<Feature, DuplicateFeatureName> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(DuplicateFeatureName { name });
        }
        let id = self.next_id();
        let feature = Feature::new(id, Some(name.clone()));
        self.by_name.insert(name, id);
        self.features.push(feature.clone());
        Ok(feature)
    }

    /// Declares an anonymous feature: it gets an id but no name, so caches
    /// will re-evaluate it on every request.
    pub fn declare_anonymous(&mut self) -> Feature {
        let feature = Feature::new(self.next_id(), None);
        self.features.push(feature.clone());
        feature
    }

    pub fn get(&self, id: FeatureId) -> Option<&Feature> {
        self.features.get(id.to_raw() as usize)
    }

    pub fn by_name(&self, name: &str) -> Option<&Feature> {
        let id = *self.by_name.get(name)?;
        self.get(id)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }

    fn next_id(&self) -> FeatureId {
        FeatureId::from_raw(self.features.len() as u32)
    }
}

impl FeatureLookup for FeatureSet {
    fn resolve(&self, identifier: &str) -> Option<Feature> {
        self.by_name(identifier).cloned()
    }
}
