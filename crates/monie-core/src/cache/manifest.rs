use url::Url;

use crate::error::Result;

/// Resources that must all be cached before a generation counts as installed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrecacheManifest {
    paths: Vec<String>,
}

impl PrecacheManifest {
    /// Build a manifest, dropping repeated paths but keeping first-seen order.
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for path in paths {
            let path = path.into();
            if !unique.contains(&path) {
                unique.push(path);
            }
        }
        Self { paths: unique }
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Resolve every path against the app origin.
    pub fn resolve(&self, origin: &Url) -> Result<Vec<Url>> {
        self.paths
            .iter()
            .map(|path| origin.join(path).map_err(Into::into))
            .collect()
    }
}
