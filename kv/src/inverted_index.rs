//! Inverted text index: word -> set of keys, for AND/OR search over values.
//! Grounded on `original_source/server/indexes/inverted_index.py`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use regex::Regex;

use crate::error::CResult;

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+").unwrap())
}

/// Intersection or union of per-token postings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    And,
    Or,
}

impl SearchMode {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("or") {
            SearchMode::Or
        } else {
            SearchMode::And
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    word_regex()
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

struct Inner {
    postings: HashMap<String, HashSet<String>>,
}

/// word -> set of keys whose value tokenizes to that word.
pub struct InvertedIndex {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl InvertedIndex {
    pub fn open(path: impl AsRef<Path>) -> CResult<Self> {
        let path = path.as_ref().to_path_buf();
        let postings = Self::load(&path).unwrap_or_default();
        Ok(Self {
            path,
            inner: Mutex::new(Inner { postings }),
        })
    }

    fn load(path: &Path) -> Option<HashMap<String, HashSet<String>>> {
        let data = std::fs::read_to_string(path).ok()?;
        let raw: HashMap<String, Vec<String>> = serde_json::from_str(&data).ok()?;
        Some(raw.into_iter().map(|(k, v)| (k, v.into_iter().collect())).collect())
    }

    /// Indexes a key/value pair: every token of `value` gets `key` added to
    /// its posting.
    pub fn add(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock().unwrap();
        for token in tokenize(value) {
            inner.postings.entry(token).or_default().insert(key.to_string());
        }
    }

    /// Removes `key` from every posting it appears in, pruning emptied
    /// postings. Correctness doesn't depend on the caller passing the
    /// key's old value; `old_value` is accepted only as a future
    /// optimization hook and currently unused, matching the teacher's
    /// own full-scan `remove`.
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.postings.retain(|_, keys| {
            keys.remove(key);
            !keys.is_empty()
        });
    }

    pub fn update(&self, key: &str, new_value: &str) {
        self.remove(key);
        self.add(key, new_value);
    }

    /// Tokenizes `query`; AND intersects every token's posting, OR unions
    /// them. Empty query tokens (including missing tokens looked up as
    /// empty sets) yield an empty result, never an error.
    pub fn search(&self, query: &str, mode: SearchMode) -> Vec<String> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let inner = self.inner.lock().unwrap();
        let postings: Vec<HashSet<String>> = tokens
            .iter()
            .map(|t| inner.postings.get(t).cloned().unwrap_or_default())
            .collect();

        match mode {
            SearchMode::And => {
                let mut iter = postings.into_iter();
                let Some(first) = iter.next() else {
                    return Vec::new();
                };
                iter.fold(first, |acc, set| acc.intersection(&set).cloned().collect())
                    .into_iter()
                    .collect()
            }
            SearchMode::Or => {
                let mut union = HashSet::new();
                for set in postings {
                    union.extend(set);
                }
                union.into_iter().collect()
            }
        }
    }

    /// Persists the full mapping as word -> list of keys.
    pub fn save(&self) -> CResult<()> {
        let inner = self.inner.lock().unwrap();
        let serializable: HashMap<&String, Vec<&String>> = inner
            .postings
            .iter()
            .map(|(k, v)| (k, v.iter().collect()))
            .collect();
        let data = serde_json::to_string(&serializable)?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn index() -> (TempDir, InvertedIndex) {
        let dir = TempDir::new().unwrap();
        let idx = InvertedIndex::open(dir.path().join("inverted_index.json")).unwrap();
        (dir, idx)
    }

    #[test]
    fn and_or_search() {
        let (_dir, idx) = index();
        idx.add("doc1", "hello world python");
        idx.add("doc2", "hello flask web");
        idx.add("doc3", "python is great");

        let mut and = idx.search("hello python", SearchMode::And);
        and.sort();
        assert_eq!(and, vec!["doc1".to_string()]);

        let mut or = idx.search("flask python", SearchMode::Or);
        or.sort();
        assert_eq!(or, vec!["doc1".to_string(), "doc2".to_string(), "doc3".to_string()]);
    }

    #[test]
    fn remove_prunes_empty_postings() {
        let (_dir, idx) = index();
        idx.add("k", "word");
        idx.remove("k");
        assert!(idx.search("word", SearchMode::Or).is_empty());
    }

    #[test]
    fn update_replaces_tokens() {
        let (_dir, idx) = index();
        idx.add("k", "old value");
        idx.update("k", "new value");
        assert!(idx.search("old", SearchMode::Or).is_empty());
        assert_eq!(idx.search("new", SearchMode::Or), vec!["k".to_string()]);
    }

    #[test]
    fn empty_query_is_empty_result() {
        let (_dir, idx) = index();
        idx.add("k", "word");
        assert!(idx.search("   ", SearchMode::And).is_empty());
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inverted_index.json");
        {
            let idx = InvertedIndex::open(&path).unwrap();
            idx.add("k", "hello world");
            idx.save().unwrap();
        }
        let idx = InvertedIndex::open(&path).unwrap();
        assert_eq!(idx.search("hello", SearchMode::Or), vec!["k".to_string()]);
    }
}
