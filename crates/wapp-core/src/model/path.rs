use std::fmt;

use serde::{Deserialize, Serialize};

/// Slash-delimited address of a remote object or service topic.
///
/// Stored without leading or trailing slashes, so `"/device/123/"` and
/// `"device/123"` are the same path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ModelPath(String);

impl ModelPath {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim_matches('/').to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Final segment, or `""` for the root.
    pub fn last_segment(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Path minus its last segment. `None` for single-segment paths.
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| Self(parent.to_owned()))
    }

    /// Append a segment.
    pub fn join(&self, segment: &str) -> Self {
        let segment = segment.trim_matches('/');
        if self.0.is_empty() {
            Self(segment.to_owned())
        } else {
            Self(format!("{}/{segment}", self.0))
        }
    }

    /// Segment-aware prefix test: `notification` covers `notification`
    /// and `notification/abc`, but not `notifications`.
    pub fn starts_with(&self, prefix: &Self) -> bool {
        if prefix.0.is_empty() {
            return true;
        }
        match self.0.strip_prefix(prefix.0.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

impl fmt::Display for ModelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl From<&str> for ModelPath {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for ModelPath {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl From<ModelPath> for String {
    fn from(path: ModelPath) -> Self {
        path.0
    }
}

impl AsRef<str> for ModelPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
