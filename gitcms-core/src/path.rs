//! Logical content locations and their storage paths
//!
//! Every file a site edits lives in one of a small, closed set of directory
//! kinds. Mapping them through [`ContentDir`] keeps storage path construction
//! in one place.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Directory holding pages that belong to no collection
pub const UNLINKED_PAGES_DIR: &str = "pages";
/// Directory holding site data files
pub const DATA_DIR: &str = "_data";
/// Ordering file inside collections and subcollections
pub const COLLECTION_CONFIG: &str = "collection.yml";
/// Navigation file name (inside [`DATA_DIR`])
pub const NAVIGATION_FILE: &str = "navigation.yml";
/// Site configuration file (repository root)
pub const SITE_CONFIG: &str = "_config.yml";

/// Kind of directory a content file lives in
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentDir {
    /// Repository root
    Root,
    /// Standalone pages
    Unlinked,
    /// `_data`
    Data,
    /// A top-level collection, stored as `_<name>`
    Collection { name: String },
    /// A folder nested inside a collection
    Subcollection { name: String, parent: String },
    /// A resource room category, stored as `<room>/<category>/_posts`
    Resource { room: String, category: String },
}

impl ContentDir {
    pub fn collection(name: impl Into<String>) -> Self {
        ContentDir::Collection { name: name.into() }
    }

    pub fn subcollection(name: impl Into<String>, parent: impl Into<String>) -> Self {
        ContentDir::Subcollection {
            name: name.into(),
            parent: parent.into(),
        }
    }

    pub fn resource(room: impl Into<String>, category: impl Into<String>) -> Self {
        ContentDir::Resource {
            room: room.into(),
            category: category.into(),
        }
    }

    /// Storage directory relative to the repository root (empty for root)
    pub fn storage_dir(&self) -> Result<String> {
        Ok(match self {
            ContentDir::Root => String::new(),
            ContentDir::Unlinked => UNLINKED_PAGES_DIR.to_string(),
            ContentDir::Data => DATA_DIR.to_string(),
            ContentDir::Collection { name } => format!("_{}", segment(name)?),
            ContentDir::Subcollection { name, parent } => {
                format!("_{}/{}", segment(parent)?, segment(name)?)
            }
            ContentDir::Resource { room, category } => {
                format!("{}/{}/_posts", segment(room)?, segment(category)?)
            }
        })
    }

    /// Ordering file for collection-like directories
    pub fn ordering_file(&self) -> Option<ContentPath> {
        match self {
            ContentDir::Collection { .. } | ContentDir::Subcollection { .. } => {
                Some(ContentPath::new(self.clone(), COLLECTION_CONFIG))
            }
            _ => None,
        }
    }

    /// Path of a file in this directory
    pub fn file(&self, file_name: impl Into<String>) -> ContentPath {
        ContentPath::new(self.clone(), file_name)
    }
}

/// A file inside a [`ContentDir`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentPath {
    pub dir: ContentDir,
    pub file_name: String,
}

impl ContentPath {
    pub fn new(dir: ContentDir, file_name: impl Into<String>) -> Self {
        Self {
            dir,
            file_name: file_name.into(),
        }
    }

    /// `_data/navigation.yml`
    pub fn navigation() -> Self {
        Self::new(ContentDir::Data, NAVIGATION_FILE)
    }

    /// `_config.yml`
    pub fn site_config() -> Self {
        Self::new(ContentDir::Root, SITE_CONFIG)
    }

    /// Storage path relative to the repository root
    pub fn storage_path(&self) -> Result<String> {
        let file = segment(&self.file_name)?;
        let dir = self.dir.storage_dir()?;
        if dir.is_empty() {
            Ok(file.to_string())
        } else {
            Ok(format!("{}/{}", dir, file))
        }
    }
}

impl std::fmt::Display for ContentPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.storage_path() {
            Ok(p) => write!(f, "{}", p),
            Err(_) => write!(f, "<invalid {:?}/{}>", self.dir, self.file_name),
        }
    }
}

/// Anything that resolves to a storage path. Raw `&str` paths are validated
/// segment by segment.
pub trait StoragePath {
    fn to_storage_path(&self) -> Result<String>;
}

impl StoragePath for ContentPath {
    fn to_storage_path(&self) -> Result<String> {
        self.storage_path()
    }
}

impl StoragePath for str {
    fn to_storage_path(&self) -> Result<String> {
        normalize(self)
    }
}

impl StoragePath for String {
    fn to_storage_path(&self) -> Result<String> {
        normalize(self)
    }
}

impl<T: StoragePath + ?Sized> StoragePath for &T {
    fn to_storage_path(&self) -> Result<String> {
        (**self).to_storage_path()
    }
}

/// Validate a raw slash-separated path and strip leading/trailing slashes
pub fn normalize(path: &str) -> Result<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(StoreError::InvalidPath(format!("empty path '{}'", path)));
    }
    for part in trimmed.split('/') {
        segment(part).map_err(|_| StoreError::InvalidPath(path.to_string()))?;
    }
    Ok(trimmed.to_string())
}

fn segment(name: &str) -> Result<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(StoreError::InvalidPath(format!("invalid path segment '{}'", name)));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_paths() {
        let cases = [
            (ContentDir::Unlinked.file("faq.md"), "pages/faq.md"),
            (ContentDir::collection("news").file("a.md"), "_news/a.md"),
            (
                ContentDir::subcollection("2024", "news").file("b.md"),
                "_news/2024/b.md",
            ),
            (
                ContentDir::resource("media", "press").file("2024-01-01-c.md"),
                "media/press/_posts/2024-01-01-c.md",
            ),
            (ContentPath::navigation(), "_data/navigation.yml"),
            (ContentPath::site_config(), "_config.yml"),
        ];
        for (path, expected) in cases {
            assert_eq!(path.storage_path().unwrap(), expected);
        }
    }

    #[test]
    fn test_ordering_file() {
        let dir = ContentDir::subcollection("2024", "news");
        assert_eq!(
            dir.ordering_file().unwrap().storage_path().unwrap(),
            "_news/2024/collection.yml"
        );
        assert!(ContentDir::Unlinked.ordering_file().is_none());
        assert!(ContentDir::resource("media", "press").ordering_file().is_none());
    }

    #[test]
    fn test_rejects_traversal_and_separators() {
        assert!(ContentDir::collection("..").file("a.md").storage_path().is_err());
        assert!(ContentDir::Unlinked.file("a/b.md").storage_path().is_err());
        assert!(ContentDir::Unlinked.file("").storage_path().is_err());
        assert!(ContentDir::resource("media", "").file("a.md").storage_path().is_err());
    }

    #[test]
    fn test_normalize_raw_paths() {
        assert_eq!(normalize("/pages/foo.md").unwrap(), "pages/foo.md");
        assert!(normalize("pages//foo.md").is_err());
        assert!(normalize("pages/../secrets").is_err());
        assert!(normalize("/").is_err());
    }

    #[test]
    fn test_content_dir_serde_tagged() {
        let dir = ContentDir::subcollection("2024", "news");
        let json = serde_json::to_string(&dir).unwrap();
        assert_eq!(json, r#"{"kind":"subcollection","name":"2024","parent":"news"}"#);
    }
}
