//! Classpath lookup: which resource idents belong to which classpath

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;

/// A classpath node with its member resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClasspathEntry {
    pub id: i64,
    /// Dotted or slash separated path, e.g. `corp.dept.app`
    pub path: String,
    #[serde(default)]
    pub res: Vec<String>,
}

/// Classpath queries used by rule filters and ident resolution
pub trait Classpath: Send + Sync {
    /// Whether `ident` is a member of the classpath with path `classpath`
    fn exists(&self, ident: &str, classpath: &str) -> bool;

    /// Paths of every classpath `ident` belongs to
    fn get_values(&self, ident: &str) -> Vec<String>;

    fn get(&self, id: i64) -> Option<ClasspathEntry>;

    /// Classpaths whose path starts with `prefix`
    fn gets_by_prefix(&self, prefix: &str) -> Vec<ClasspathEntry>;
}

#[derive(Default)]
struct ClasspathIndex {
    by_id: HashMap<i64, ClasspathEntry>,
    by_ident: HashMap<String, Vec<String>>,
}

impl ClasspathIndex {
    fn build(entries: Vec<ClasspathEntry>) -> Self {
        let mut by_ident: HashMap<String, Vec<String>> = HashMap::new();
        for entry in &entries {
            for ident in &entry.res {
                by_ident
                    .entry(ident.clone())
                    .or_default()
                    .push(entry.path.clone());
            }
        }
        for paths in by_ident.values_mut() {
            paths.sort();
            paths.dedup();
        }

        Self {
            by_id: entries.into_iter().map(|e| (e.id, e)).collect(),
            by_ident,
        }
    }
}

/// Snapshot-swapped in-memory classpath
#[derive(Default)]
pub struct MemoryClasspath {
    index: RwLock<ClasspathIndex>,
}

impl MemoryClasspath {
    pub fn new(entries: Vec<ClasspathEntry>) -> Self {
        Self {
            index: RwLock::new(ClasspathIndex::build(entries)),
        }
    }

    /// Load `[{id, path, res[]}]` from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(read_entries(path.as_ref())?))
    }

    /// Replace the whole snapshot
    pub fn replace(&self, entries: Vec<ClasspathEntry>) {
        let index = ClasspathIndex::build(entries);
        *self.index.write() = index;
    }

    pub fn reload(&self, path: impl AsRef<Path>) -> Result<usize> {
        let entries = read_entries(path.as_ref())?;
        let count = entries.len();
        self.replace(entries);
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.index.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_entries(path: &Path) -> Result<Vec<ClasspathEntry>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

impl Classpath for MemoryClasspath {
    fn exists(&self, ident: &str, classpath: &str) -> bool {
        self.index
            .read()
            .by_ident
            .get(ident)
            .map(|paths| paths.iter().any(|p| p == classpath))
            .unwrap_or(false)
    }

    fn get_values(&self, ident: &str) -> Vec<String> {
        self.index
            .read()
            .by_ident
            .get(ident)
            .cloned()
            .unwrap_or_default()
    }

    fn get(&self, id: i64) -> Option<ClasspathEntry> {
        self.index.read().by_id.get(&id).cloned()
    }

    fn gets_by_prefix(&self, prefix: &str) -> Vec<ClasspathEntry> {
        let mut entries: Vec<ClasspathEntry> = self
            .index
            .read()
            .by_id
            .values()
            .filter(|e| e.path.starts_with(prefix))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> MemoryClasspath {
        MemoryClasspath::new(vec![
            ClasspathEntry {
                id: 1,
                path: "corp.web".into(),
                res: vec!["host-a".into(), "host-b".into()],
            },
            ClasspathEntry {
                id: 2,
                path: "corp.web.api".into(),
                res: vec!["host-a".into()],
            },
            ClasspathEntry {
                id: 3,
                path: "corp.db".into(),
                res: vec!["host-c".into()],
            },
        ])
    }

    #[test]
    fn test_exists_and_values() {
        let cp = sample();
        assert!(cp.exists("host-a", "corp.web.api"));
        assert!(!cp.exists("host-b", "corp.web.api"));
        assert!(!cp.exists("unknown", "corp.web"));
        assert_eq!(cp.get_values("host-a"), vec!["corp.web", "corp.web.api"]);
        assert!(cp.get_values("nobody").is_empty());
    }

    #[test]
    fn test_gets_by_prefix() {
        let cp = sample();
        let ids: Vec<i64> = cp.gets_by_prefix("corp.web").iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(cp.get(3).unwrap().res, vec!["host-c"]);
    }

    #[test]
    fn test_load_and_reload_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"id": 9, "path": "ops", "res": ["x"]}}]"#).unwrap();

        let cp = MemoryClasspath::from_file(file.path()).unwrap();
        assert_eq!(cp.len(), 1);
        assert!(cp.exists("x", "ops"));

        cp.replace(Vec::new());
        assert!(cp.is_empty());
        assert_eq!(cp.reload(file.path()).unwrap(), 1);
    }
}
