//! Identifier resolution across nested cache scopes.
//!
//! Callers address features with identifiers that may carry scope prefixes,
//! e.g. `"roi.glcm.contrast"` asked of a cache whose scopes ignore `"roi."`
//! and `"glcm."`. Resolution walks an ordered list of stages (outermost scope
//! first); each stage strips at most one of its prefixes, then hands the rest
//! to the next stage. Whatever remains is the feature name to look up.

/// Ignore-prefixes contributed by one nesting level.
///
/// Within a stage the first matching prefix wins; the order prefixes were
/// given in is preserved. Empty prefixes are dropped, since they would match
/// everything without consuming anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixStage {
    prefixes: Vec<String>,
}

impl PrefixStage {
    pub fn new<P>(prefixes: impl IntoIterator<Item = P>) -> Self
    where
        P: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    fn strip<'a>(&self, identifier: &'a str) -> Option<&'a str> {
        self.prefixes
            .iter()
            .find_map(|prefix| identifier.strip_prefix(prefix.as_str()))
    }
}

/// Flattened chain of resolution stages, outermost scope first.
///
/// A stage that matches nothing passes the identifier through unchanged;
/// stages never backtrack, so a prefix consumed early is gone even if a later
/// stage could have used the original spelling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierResolver {
    stages: Vec<PrefixStage>,
}

impl IdentifierResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-stage resolver, the common case for an unnested session.
    pub fn from_prefixes<P>(prefixes: impl IntoIterator<Item = P>) -> Self
    where
        P: Into<String>,
    {
        Self {
            stages: vec![PrefixStage::new(prefixes)],
        }
    }

    /// Appends `stage` as the innermost resolution level.
    pub fn push_stage(&mut self, stage: PrefixStage) {
        self.stages.push(stage);
    }

    /// Builder form of [`push_stage`](Self::push_stage).
    pub fn with_stage(mut self, stage: PrefixStage) -> Self {
        self.push_stage(stage);
        self
    }

    pub fn stages(&self) -> &[PrefixStage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.iter().all(|s| s.prefixes.is_empty())
    }

    /// Strips scope prefixes from `identifier`, one per stage at most.
    ///
    /// Borrows from the input: the result is always a suffix of
    /// `identifier`.
    pub fn resolve<'a>(&self, identifier: &'a str) -> &'a str {
        let mut current = identifier;
        for stage in &self.stages {
            if let Some(rest) = stage.strip(current) {
                current = rest;
            }
        }
        current
    }
}
