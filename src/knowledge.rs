//! Filesystem knowledge operations: keyword search over the markdown
//! corpus, the skill inventory, and named document lookup
//! (protocol / EUREKA / truth).

use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Deserialize;

use crate::error::{Result, ServerError, UPGRADE_URL};
use crate::types::{DataPaths, FREE_SKILL_PREVIEW, MAX_DOC_READ};

// ---------------------------------------------------------------------------
// Corpus walk
// ---------------------------------------------------------------------------

fn collect_md_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_md_files(&path, out);
        } else if path.extension().is_some_and(|e| e == "md") {
            out.push(path);
        }
    }
}

pub fn knowledge_file_count(paths: &DataPaths) -> usize {
    let mut files = Vec::new();
    collect_md_files(&paths.knowledge_dir, &mut files);
    files.len()
}

pub fn eureka_count(paths: &DataPaths) -> usize {
    fs::read_dir(&paths.eureka_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().extension().is_some_and(|x| x == "md"))
                .count()
        })
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Keyword search
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, serde::Serialize)]
pub struct KnowledgeHit {
    pub path: String,
    pub score: usize,
    pub preview: String,
    pub size: usize,
}

fn preview_of(content: &str, max: usize) -> String {
    let mut end = content.len().min(max);
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    content[..end].replace('\n', " ").trim().to_string()
}

/// Rank knowledge files by how many query words they contain. Filename hits
/// and EUREKA provenance get a bonus.
pub fn search_knowledge(paths: &DataPaths, query: &str, max_results: usize) -> Vec<KnowledgeHit> {
    let query_words: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.to_string())
        .collect();
    if query_words.is_empty() {
        return Vec::new();
    }

    let mut files = Vec::new();
    collect_md_files(&paths.knowledge_dir, &mut files);

    let mut hits: Vec<KnowledgeHit> = files
        .par_iter()
        .filter_map(|path| {
            let content = fs::read_to_string(path).ok()?;
            if content.len() > MAX_DOC_READ {
                return None;
            }
            let content_lower = content.to_lowercase();
            let name_lower = path.file_name()?.to_str()?.to_lowercase();

            let mut score = query_words
                .iter()
                .filter(|w| content_lower.contains(w.as_str()) || name_lower.contains(w.as_str()))
                .count();
            if score == 0 {
                return None;
            }
            if query_words.iter().any(|w| name_lower.contains(w.as_str())) {
                score += 2;
            }
            if path.starts_with(&paths.eureka_dir) {
                score += 1;
            }

            let rel = path
                .strip_prefix(&paths.root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            Some(KnowledgeHit { path: rel, score, preview: preview_of(&content, 300), size: content.len() })
        })
        .collect();

    hits.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
    hits.truncate(max_results);
    hits
}

// ---------------------------------------------------------------------------
// Skill inventory
// ---------------------------------------------------------------------------

/// Optional per-skill compatibility descriptor (`compat.json`).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SkillCompat {
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub frameworks: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

pub fn skill_inventory(paths: &DataPaths) -> Vec<String> {
    let Ok(entries) = fs::read_dir(&paths.skills_dir) else { return Vec::new() };
    let mut skills: Vec<String> = entries
        .flatten()
        .filter_map(|e| {
            let path = e.path();
            let name = path.file_name()?.to_str()?.to_string();
            if path.is_dir() {
                Some(name)
            } else if name.ends_with(".md") {
                Some(name.trim_end_matches(".md").to_string())
            } else {
                None
            }
        })
        .collect();
    skills.sort();
    skills.dedup();
    skills
}

pub fn skill_compat(paths: &DataPaths, skill: &str) -> Option<SkillCompat> {
    let raw = fs::read_to_string(paths.skills_dir.join(skill).join("compat.json")).ok()?;
    serde_json::from_str(&raw).ok()
}

/// List skills, optionally filtered and scored by a stack keyword.
pub fn list_skills(paths: &DataPaths, stack: Option<&str>) -> String {
    let skills = skill_inventory(paths);
    if skills.is_empty() {
        return "Available skills (0):\n(none found)".to_string();
    }

    match stack {
        None => {
            let mut out = format!("Available skills ({}):\n", skills.len());
            for skill in &skills {
                out.push_str(&format!("- {skill}\n"));
            }
            out
        }
        Some(stack) => {
            let stack_lower = stack.to_lowercase();
            let mut scored: Vec<(usize, &String)> = skills
                .iter()
                .map(|skill| {
                    let mut score = 0usize;
                    if skill.to_lowercase().contains(&stack_lower) {
                        score += 3;
                    }
                    if let Some(compat) = skill_compat(paths, skill) {
                        if compat.languages.iter().any(|l| l.to_lowercase() == stack_lower) {
                            score += 3;
                        }
                        if compat.frameworks.iter().any(|f| f.to_lowercase() == stack_lower) {
                            score += 3;
                        }
                        if compat.keywords.iter().any(|k| k.to_lowercase().contains(&stack_lower)) {
                            score += 1;
                        }
                    }
                    (score, skill)
                })
                .filter(|(score, _)| *score > 0)
                .collect();
            scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

            if scored.is_empty() {
                return format!(
                    "Available skills ({}): no match for stack '{stack}'. Call without a filter for the full list.",
                    skills.len()
                );
            }
            let mut out =
                format!("Available skills ({}) matching '{stack}':\n", scored.len());
            for (score, skill) in scored {
                out.push_str(&format!("- {skill} (score {score})\n"));
            }
            out
        }
    }
}

// ---------------------------------------------------------------------------
// Skill content
// ---------------------------------------------------------------------------

/// Skill names are a single path segment: letters, digits, underscore, dash.
pub fn validate_skill_name(name: &str) -> Result<()> {
    // The raw name is never echoed back: traversal probes should not see
    // their own payload reflected in the error.
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ServerError::invalid(
            "Invalid name: only letters, digits, '_' and '-' are allowed".to_string(),
        ));
    }
    Ok(())
}

/// Resolve a skill's document path. Checks the resolved path is still inside
/// the skills root (symlink defense on top of the name whitelist).
fn resolve_skill_path(paths: &DataPaths, name: &str) -> Result<PathBuf> {
    validate_skill_name(name)?;
    let base = paths.skills_dir.join(name);

    let candidates = [base.join("SKILL.md"), base.join("README.md"), base.with_extension("md")];
    let file = candidates
        .iter()
        .find(|p| p.is_file())
        .ok_or_else(|| ServerError::NotFound(format!("Skill '{name}' not found.")))?;

    let canonical = file
        .canonicalize()
        .map_err(|_| ServerError::NotFound(format!("Skill '{name}' not found.")))?;
    let root = paths
        .skills_dir
        .canonicalize()
        .map_err(|_| ServerError::NotFound("Skills directory unavailable".to_string()))?;
    if !canonical.starts_with(&root) {
        return Err(ServerError::invalid("Invalid skill path".to_string()));
    }
    Ok(canonical)
}

/// Cut at a char boundary near `max`, preferring the last line break in the
/// tail so the preview does not end mid-sentence.
fn truncate_at_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    match text[..end].rfind('\n') {
        Some(pos) if pos > max / 2 => &text[..pos],
        _ => &text[..end],
    }
}

/// Fetch skill content. Unauthenticated callers get a ~400-char preview with
/// an upgrade notice appended.
pub fn get_skill(paths: &DataPaths, name: &str, authenticated: bool) -> Result<String> {
    let path = resolve_skill_path(paths, name)?;
    let content = fs::read_to_string(&path)
        .map_err(|_| ServerError::NotFound(format!("Skill '{name}' not found.")))?;

    if authenticated {
        return Ok(content);
    }
    let preview = truncate_at_boundary(&content, FREE_SKILL_PREVIEW);
    Ok(format!(
        "{preview}\n\n---\n*Note: Full content available with an API key — see {UPGRADE_URL}*"
    ))
}

// ---------------------------------------------------------------------------
// Named documents (protocol / EUREKA / truth)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub enum DocKind {
    Protocol,
    Eureka,
    Truth,
}

impl DocKind {
    pub fn label(self) -> &'static str {
        match self {
            DocKind::Protocol => "Protocol",
            DocKind::Eureka => "EUREKA document",
            DocKind::Truth => "Truth patch",
        }
    }

    fn dir(self, paths: &DataPaths) -> &Path {
        match self {
            DocKind::Protocol => &paths.protocols_dir,
            DocKind::Eureka => &paths.eureka_dir,
            DocKind::Truth => &paths.truth_dir,
        }
    }
}

/// Fetch a document by canonical name, falling back to a case-insensitive
/// scan of the directory.
pub fn get_document(paths: &DataPaths, kind: DocKind, name: &str) -> Result<String> {
    validate_skill_name(name)?;
    let dir = kind.dir(paths);

    let exact = dir.join(format!("{name}.md"));
    if let Ok(content) = fs::read_to_string(&exact) {
        return Ok(content);
    }

    let wanted = format!("{}.md", name.to_lowercase());
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.to_lowercase() == wanted {
                if let Ok(content) = fs::read_to_string(entry.path()) {
                    return Ok(content);
                }
            }
        }
    }

    Err(ServerError::NotFound(format!("{} '{name}' not found.", kind.label())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, DataPaths) {
        let dir = TempDir::new().unwrap();
        let paths = DataPaths::new(dir.path().to_path_buf());
        fs::create_dir_all(&paths.eureka_dir).unwrap();
        fs::create_dir_all(paths.skills_dir.join("rag-pipeline")).unwrap();
        fs::write(
            paths.knowledge_dir.join("caching_notes.md"),
            "# Caching\nSemantic caching cuts latency and token cost.\n",
        )
        .unwrap();
        fs::write(
            paths.eureka_dir.join("EUREKA_CACHE_2026.md"),
            "# EUREKA\nResponse caching validated across three projects.\n",
        )
        .unwrap();
        fs::write(
            paths.skills_dir.join("rag-pipeline").join("SKILL.md"),
            "# RAG pipeline skill\n".to_string() + &"Chunk, embed, retrieve, rerank.\n".repeat(40),
        )
        .unwrap();
        fs::write(
            paths.skills_dir.join("rag-pipeline").join("compat.json"),
            r#"{"languages":["python","rust"],"frameworks":[],"keywords":["rag","retrieval"]}"#,
        )
        .unwrap();
        (dir, paths)
    }

    #[test]
    fn search_scores_eureka_and_filename_hits() {
        let (_dir, paths) = fixture();
        let hits = search_knowledge(&paths, "caching", 5);
        assert_eq!(hits.len(), 2);
        // filename bonus puts caching_notes.md first
        assert!(hits[0].path.ends_with("caching_notes.md"));
    }

    #[test]
    fn skill_listing_and_stack_filter() {
        let (_dir, paths) = fixture();
        let all = list_skills(&paths, None);
        assert!(all.contains("Available skills"));
        assert!(all.contains("rag-pipeline"));

        let filtered = list_skills(&paths, Some("python"));
        assert!(filtered.contains("rag-pipeline"));
        let none = list_skills(&paths, Some("cobol"));
        assert!(none.contains("no match"));
    }

    #[test]
    fn get_skill_truncates_for_unauthenticated() {
        let (_dir, paths) = fixture();
        let full = get_skill(&paths, "rag-pipeline", true).unwrap();
        assert!(full.len() > FREE_SKILL_PREVIEW);

        let preview = get_skill(&paths, "rag-pipeline", false).unwrap();
        assert!(preview.len() < 800);
        assert!(preview.contains("pricing"));
    }

    #[test]
    fn traversal_names_are_rejected() {
        let (_dir, paths) = fixture();
        for name in ["../../../etc/passwd", "..\\..\\win", "<script>alert(1)</script>", "a/b"] {
            let err = get_skill(&paths, name, false).unwrap_err();
            assert!(!err.to_string().contains("passwd"));
            assert!(matches!(err, ServerError::InvalidArgument(_)));
        }
    }

    #[test]
    fn document_lookup_is_case_insensitive() {
        let (_dir, paths) = fixture();
        assert!(get_document(&paths, DocKind::Eureka, "EUREKA_CACHE_2026").is_ok());
        assert!(get_document(&paths, DocKind::Eureka, "eureka_cache_2026").is_ok());
        let err = get_document(&paths, DocKind::Eureka, "missing").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
