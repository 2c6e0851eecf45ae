use serde::{Deserialize, Serialize};

use crate::value::PropertyMap;

/// File-like content: literal text, a path on the deployment machine, or a
/// URI the provider resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// SHA-256 of the content, when it has been computed.
    pub hash: Option<String>,
    pub contents: AssetContents,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssetContents {
    Text(String),
    Path(String),
    Uri(String),
}

impl Asset {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            hash: None,
            contents: AssetContents::Text(text.into()),
        }
    }

    pub fn path(path: impl Into<String>) -> Self {
        Self {
            hash: None,
            contents: AssetContents::Path(path.into()),
        }
    }

    /// Hash equality when both sides carry a hash; structural otherwise.
    pub fn equivalent(&self, other: &Asset) -> bool {
        match (&self.hash, &other.hash) {
            (Some(a), Some(b)) => a == b,
            _ => self.contents == other.contents,
        }
    }
}

/// A collection of assets: a literal map, a directory path, or a URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    pub hash: Option<String>,
    pub contents: ArchiveContents,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArchiveContents {
    /// Named assets; values must be `Asset` or `Archive` properties.
    Assets(PropertyMap),
    Path(String),
    Uri(String),
}

impl Archive {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            hash: None,
            contents: ArchiveContents::Path(path.into()),
        }
    }

    pub fn equivalent(&self, other: &Archive) -> bool {
        match (&self.hash, &other.hash) {
            (Some(a), Some(b)) => a == b,
            _ => self.contents == other.contents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_dominate_contents() {
        let a = Asset {
            hash: Some("abc".into()),
            contents: AssetContents::Text("one".into()),
        };
        let b = Asset {
            hash: Some("abc".into()),
            contents: AssetContents::Path("/two".into()),
        };
        assert!(a.equivalent(&b));
    }

    #[test]
    fn missing_hash_falls_back_to_contents() {
        let a = Asset::text("same");
        let mut b = Asset::text("same");
        assert!(a.equivalent(&b));
        b.contents = AssetContents::Text("different".into());
        assert!(!a.equivalent(&b));
    }
}
