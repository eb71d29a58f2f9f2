use crate::error::GatewayError;
use std::collections::HashSet;
use std::path::Path;

/// Set of valid API keys, loaded once at startup and never mutated.
///
/// Keys are opaque: membership is the only thing checked. Shared across
/// request tasks as `Arc<KeyStore>` without any locking.
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    keys: HashSet<String>,
}

impl KeyStore {
    /// Read a newline-delimited key file.
    ///
    /// Blank and whitespace-only lines are skipped, so the empty string is
    /// never a member. Every other line is stored verbatim.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let content = std::fs::read_to_string(path).map_err(|source| GatewayError::KeySource {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_lines(&content))
    }

    /// Build from in-memory key file content.
    pub fn from_lines(content: &str) -> Self {
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<String> for KeyStore {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}
