//! Data directory layout and segment discovery.
//!
//! Segments live under `<data_dir>/<database>/<retention_policy>/...`. The
//! locator walks the tree, classifies every segment by its database and
//! retention policy and groups them into deletion units.

use crate::error::{PurgeError, Result};
use crate::segment::SEGMENT_EXTENSION;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// A `(database, retention policy)` pair grouping segment files.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeletionUnit {
    /// Database name.
    pub database: String,
    /// Retention policy name.
    pub retention_policy: String,
}

impl DeletionUnit {
    /// Creates a deletion unit.
    pub fn new(database: impl Into<String>, retention_policy: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            retention_policy: retention_policy.into(),
        }
    }
}

impl fmt::Display for DeletionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.database, self.retention_policy)
    }
}

/// A segment file classified by its position in the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLocation {
    /// Database the segment belongs to.
    pub database: String,
    /// Retention policy the segment belongs to.
    pub retention_policy: String,
    /// Full path of the segment.
    pub path: PathBuf,
}

impl SegmentLocation {
    /// Returns the deletion unit of this segment.
    pub fn unit(&self) -> DeletionUnit {
        DeletionUnit::new(&self.database, &self.retention_policy)
    }
}

/// Restricts which units are located. `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFilter {
    /// Only this database, if set.
    pub database: Option<String>,
    /// Only this retention policy, if set.
    pub retention_policy: Option<String>,
}

impl UnitFilter {
    /// Returns true if the unit passes the filter.
    pub fn matches(&self, database: &str, retention_policy: &str) -> bool {
        self.database.as_deref().map_or(true, |db| db == database)
            && self
                .retention_policy
                .as_deref()
                .map_or(true, |rp| rp == retention_policy)
    }
}

/// Segments grouped by deletion unit, each list sorted by path.
pub type LocatedSegments = BTreeMap<DeletionUnit, Vec<SegmentLocation>>;

/// The on-disk layout of a data directory.
///
/// # Examples
/// ```rust,ignore
/// use alopex_skulk_purge::layout::{SegmentLayout, UnitFilter};
///
/// let layout = SegmentLayout::new("/var/lib/skulk/data");
/// let units = layout.locate(&UnitFilter::default())?;
/// ```
#[derive(Debug, Clone)]
pub struct SegmentLayout {
    data_dir: PathBuf,
}

impl SegmentLayout {
    /// Creates a layout rooted at `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    /// Returns the root data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Finds every segment accepted by `filter`, grouped by deletion unit.
    ///
    /// Symbolic links are never followed. Nothing is modified.
    ///
    /// # Errors
    ///
    /// Returns `PurgeError::InvalidLayout` for a segment that is not below
    /// both a database and a retention policy directory, and any I/O error
    /// hit during the walk. No partial result is returned.
    pub fn locate(&self, filter: &UnitFilter) -> Result<LocatedSegments> {
        let mut segments = Vec::new();
        self.walk(&self.data_dir, &mut segments)?;

        let mut units = LocatedSegments::new();
        for path in segments {
            let location = self.classify(path)?;
            if filter.matches(&location.database, &location.retention_policy) {
                units.entry(location.unit()).or_default().push(location);
            }
        }

        for locations in units.values_mut() {
            locations.sort_by(|a, b| a.path.cmp(&b.path));
        }
        Ok(units)
    }

    fn walk(&self, dir: &Path, segments: &mut Vec<PathBuf>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                self.walk(&path, segments)?;
            } else if file_type.is_file() && is_segment(&path) {
                segments.push(path);
            }
        }
        Ok(())
    }

    /// Splits a segment path into database and retention policy.
    fn classify(&self, path: PathBuf) -> Result<SegmentLocation> {
        let relative = path
            .strip_prefix(&self.data_dir)
            .map_err(|_| PurgeError::InvalidLayout { path: path.clone() })?;

        let mut dirs = relative
            .parent()
            .into_iter()
            .flat_map(Path::components)
            .filter_map(|component| match component {
                Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
                _ => None,
            });

        match (dirs.next(), dirs.next()) {
            (Some(database), Some(retention_policy)) => Ok(SegmentLocation {
                database,
                retention_policy,
                path,
            }),
            _ => Err(PurgeError::InvalidLayout { path }),
        }
    }
}

/// Returns true if `path` has the segment file extension.
pub fn is_segment(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext == SEGMENT_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, relative: &str) -> PathBuf {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn test_locate_groups_and_sorts() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let b = touch(root, "mydb/autogen/2/000000002-000000001.segment");
        let a = touch(root, "mydb/autogen/1/000000001-000000001.segment");
        let c = touch(root, "mydb/weekly/000000003-000000001.segment");
        let d = touch(root, "other/autogen/1/000000001-000000001.segment");
        touch(root, "mydb/autogen/1/000000001-000000001.segment.rewriting.tmp");
        touch(root, "mydb/autogen/1/fields.idx");

        let units = SegmentLayout::new(root).locate(&UnitFilter::default()).unwrap();
        let keys: Vec<String> = units.keys().map(|u| u.to_string()).collect();
        assert_eq!(keys, vec!["mydb/autogen", "mydb/weekly", "other/autogen"]);

        let paths: Vec<&PathBuf> = units[&DeletionUnit::new("mydb", "autogen")]
            .iter()
            .map(|l| &l.path)
            .collect();
        assert_eq!(paths, vec![&a, &b]);
        assert_eq!(units[&DeletionUnit::new("mydb", "weekly")][0].path, c);
        assert_eq!(units[&DeletionUnit::new("other", "autogen")][0].path, d);
    }

    #[test]
    fn test_locate_applies_filters() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(root, "mydb/autogen/1/a.segment");
        touch(root, "mydb/weekly/1/b.segment");
        touch(root, "other/autogen/1/c.segment");

        let layout = SegmentLayout::new(root);
        let by_db = layout
            .locate(&UnitFilter {
                database: Some("mydb".to_string()),
                retention_policy: None,
            })
            .unwrap();
        assert_eq!(by_db.len(), 2);
        assert!(by_db.keys().all(|u| u.database == "mydb"));

        let by_rp = layout
            .locate(&UnitFilter {
                database: None,
                retention_policy: Some("autogen".to_string()),
            })
            .unwrap();
        assert_eq!(by_rp.len(), 2);
        assert!(by_rp.keys().all(|u| u.retention_policy == "autogen"));

        let both = layout
            .locate(&UnitFilter {
                database: Some("other".to_string()),
                retention_policy: Some("weekly".to_string()),
            })
            .unwrap();
        assert!(both.is_empty());
    }

    #[test]
    fn test_locate_rejects_shallow_segment() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(root, "mydb/autogen/1/a.segment");
        let shallow = touch(root, "mydb/b.segment");

        let result = SegmentLayout::new(root).locate(&UnitFilter::default());
        match result {
            Err(PurgeError::InvalidLayout { path }) => assert_eq!(path, shallow),
            other => panic!("expected InvalidLayout, got {:?}", other),
        }
    }

    #[test]
    fn test_locate_rejects_segment_at_root() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "a.segment");

        let result = SegmentLayout::new(temp_dir.path()).locate(&UnitFilter::default());
        assert!(matches!(result, Err(PurgeError::InvalidLayout { .. })));
    }

    #[test]
    fn test_locate_missing_data_dir() {
        let temp_dir = TempDir::new().unwrap();
        let result = SegmentLayout::new(temp_dir.path().join("missing"))
            .locate(&UnitFilter::default());
        assert!(matches!(result, Err(PurgeError::IoError(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_skips_symlinks() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("data");
        touch(&root, "mydb/autogen/1/a.segment");
        let outside = temp_dir.path().join("outside");
        touch(&outside, "x/y/z.segment");
        std::os::unix::fs::symlink(&outside, root.join("mydb/autogen/linked")).unwrap();

        let units = SegmentLayout::new(&root).locate(&UnitFilter::default()).unwrap();
        assert_eq!(units[&DeletionUnit::new("mydb", "autogen")].len(), 1);
    }

    #[test]
    fn test_is_segment() {
        assert!(is_segment(Path::new("a/b/000000001-000000001.segment")));
        assert!(!is_segment(Path::new("a/b/x.segment.rewriting.tmp")));
        assert!(!is_segment(Path::new("a/b/segment")));
    }
}
