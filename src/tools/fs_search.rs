use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::SearchError;
use crate::tools::{SearchEngine, SearchHit};

const CONTEXT_LINES_BEFORE: usize = 2;
const PATH_WEIGHT: f64 = 0.4;
const CONTENT_WEIGHT: f64 = 0.6;

/// Keyword-scoring search over a directory of text files.
///
/// A file scores by the share of query terms found in its relative path and
/// in its body. Reads never leave `root`.
#[derive(Clone, Debug)]
pub struct DirectorySearchEngine {
    root: PathBuf,
    extensions: Vec<String>,
}

impl DirectorySearchEngine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: ["md", "markdown", "txt", "json", "yaml", "yml"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|ext| ext.into().trim_start_matches('.').to_lowercase())
            .collect();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn accepts(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, SearchError> {
        let root = fs::canonicalize(&self.root)?;
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let resolved = fs::canonicalize(&candidate)?;
        if !resolved.starts_with(&root) {
            return Err(SearchError::OutsideRoot(candidate.display().to_string()));
        }
        Ok(resolved)
    }

    fn score(&self, relative: &str, body: &str, terms: &[String]) -> Option<(f64, String)> {
        let relative = relative.to_lowercase();
        let body = body.to_lowercase();

        let in_path: Vec<&str> = terms
            .iter()
            .filter(|term| relative.contains(term.as_str()))
            .map(String::as_str)
            .collect();
        let in_body: Vec<&str> = terms
            .iter()
            .filter(|term| body.contains(term.as_str()))
            .map(String::as_str)
            .collect();
        if in_path.is_empty() && in_body.is_empty() {
            return None;
        }

        let total = terms.len() as f64;
        let score = PATH_WEIGHT * in_path.len() as f64 / total
            + CONTENT_WEIGHT * in_body.len() as f64 / total;

        let mut reasons = Vec::new();
        if !in_path.is_empty() {
            reasons.push(format!("name matches {}", in_path.join(", ")));
        }
        if !in_body.is_empty() {
            reasons.push(format!("content mentions {}", in_body.join(", ")));
        }
        Some((score.clamp(0.0, 1.0), reasons.join("; ")))
    }
}

fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !c.is_alphanumeric() && c != '/' && c != '_')
        .map(str::to_lowercase)
        .filter(|term| term.chars().count() >= 2)
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

#[async_trait]
impl SearchEngine for DirectorySearchEngine {
    async fn find_relevant_files(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        if !self.root.is_dir() {
            return Err(SearchError::Engine(format!(
                "knowledge base directory not found: {}",
                self.root.display()
            )));
        }

        let mut hits = Vec::new();
        for entry in WalkDir::new(&self.root).into_iter().flatten() {
            if !entry.file_type().is_file() || !self.accepts(entry.path()) {
                continue;
            }
            let Ok(body) = fs::read_to_string(entry.path()) else {
                continue;
            };
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();

            if let Some((score, reason)) = self.score(&relative, &body, &terms) {
                hits.push(SearchHit {
                    path: entry.path().to_path_buf(),
                    filename: relative,
                    score,
                    reason,
                });
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        hits.truncate(max_results);
        debug!(query, hits = hits.len(), root = %self.root.display(), "directory search finished");
        Ok(hits)
    }

    async fn extract_relevant_content(
        &self,
        path: &Path,
        query: &str,
        max_chars: usize,
    ) -> Result<String, SearchError> {
        let path = self.resolve(path)?;
        let body = fs::read_to_string(&path)?;
        let terms = query_terms(query);

        let lines: Vec<&str> = body.lines().collect();
        let first_match = lines
            .iter()
            .position(|line| {
                let line = line.to_lowercase();
                terms.iter().any(|term| line.contains(term.as_str()))
            })
            .unwrap_or(0);
        let start = first_match.saturating_sub(CONTEXT_LINES_BEFORE);

        let window = lines[start..].join("\n");
        Ok(window.trim().chars().take(max_chars).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn knowledge_base() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("api")).expect("mkdir");
        fs::write(
            dir.path().join("api/customers.md"),
            "# Customers\n\nIntro text.\n\n## Create\nPOST /api/customers with a JSON body.\n",
        )
        .expect("write");
        fs::write(
            dir.path().join("api/invoices.md"),
            "# Invoices\n\nGET /api/invoices lists invoices for customers.\n",
        )
        .expect("write");
        fs::write(dir.path().join("notes.bin"), "customers customers").expect("write");
        dir
    }

    #[tokio::test]
    async fn ranks_by_name_and_content_matches() {
        let dir = knowledge_base();
        let engine = DirectorySearchEngine::new(dir.path());

        let hits = engine
            .find_relevant_files("create customers", 10)
            .await
            .expect("search");

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].filename, Path::new("api").join("customers.md").to_string_lossy());
        assert!(hits[0].score > hits[1].score);
        assert!(hits[0].reason.contains("name matches customers"));
        assert!(hits.iter().all(|hit| !hit.filename.ends_with(".bin")));
    }

    #[tokio::test]
    async fn extraction_starts_near_the_first_match() {
        let dir = knowledge_base();
        let engine = DirectorySearchEngine::new(dir.path());

        let excerpt = engine
            .extract_relevant_content(Path::new("api/customers.md"), "POST", 40)
            .await
            .expect("extract");
        assert!(excerpt.starts_with("## Create") || excerpt.contains("POST /api/customers"));
        assert!(excerpt.chars().count() <= 40);
    }

    #[tokio::test]
    async fn extraction_refuses_paths_outside_root() {
        let dir = knowledge_base();
        let engine = DirectorySearchEngine::new(dir.path().join("api"));

        let err = engine
            .extract_relevant_content(Path::new("../notes.bin"), "x", 10)
            .await
            .expect_err("outside");
        assert!(matches!(err, SearchError::OutsideRoot(_)));
    }

    #[tokio::test]
    async fn missing_root_is_an_engine_error() {
        let engine = DirectorySearchEngine::new("/definitely/not/here");
        assert!(engine.find_relevant_files("anything", 5).await.is_err());
        assert!(engine.find_relevant_files("", 5).await.expect("empty").is_empty());
    }
}
