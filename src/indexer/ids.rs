//! File classification and deterministic task-id derivation.
//!
//! Ids are dot-joined, normalized path segments under a category prefix:
//!
//! | Category | Rule | Example |
//! |----------|------|---------|
//! | explicit | id embedded in the file name wins | `tasks/TASK-12-login.md` → `TASK-12` |
//! | doc | path below the docs root | `docs/guide/setup.md` → `doc.guide.setup` |
//! | design | file stem | `design/storage-v2.md` → `design.storage-v2` |
//! | code | path below the source root, extension kept | `src/db/mod.rs` → `code.db.mod.rs` |
//! | readme | parent directory | `crates/core/README.md` → `readme.crates.core` |
//! | generic | full relative path | `notes/q3.txt` → `file.notes.q3` |
//!
//! Common file names (`index`, `config`, `mod`, ...) collide across
//! packages, so for those the full relative parent path is used instead of
//! the path below the category root.

use std::path::{Component, Path};
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::archive::types::ArchiveKind;

const MAX_ID_LEN: usize = 200;

/// `PROJ-12`, `TASK-7.3`, optionally followed by a slug: `TASK-12-fix-login`.
static EXPLICIT_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z][A-Z0-9]{1,15}-\d+(?:\.\d+)*)(?:[-_ .].*)?$").expect("valid regex")
});

const DOC_DIRS: &[&str] = &["docs", "doc", "documentation", "wiki", "guides"];
const DESIGN_DIRS: &[&str] = &["design", "designs", "rfcs", "rfc", "adr", "adrs", "specs", "proposals"];
const SOURCE_DIRS: &[&str] = &["src", "lib", "pkg", "cmd", "internal", "app", "source", "crates"];
const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "ts", "tsx", "js", "jsx", "mjs", "go", "java", "kt", "c", "h", "cpp", "hpp", "rb",
    "swift",
];

const COMMON_NAMES: &[&str] = &[
    "index", "config", "mod", "main", "lib", "utils", "util", "types", "__init__", "settings",
    "setup", "constants", "helpers", "common", "app", "routes", "models", "overview", "changelog",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Doc,
    Design,
    /// Source file under a recognized source directory.
    Code,
    Readme,
    Generic,
}

impl FileCategory {
    /// Resolve the category of a path relative to the scan root.
    pub fn classify(rel: &Path) -> Self {
        let stem = lower_stem(rel);
        if stem == "readme" {
            return Self::Readme;
        }
        let dirs = dir_names(rel);
        let ext = lower_ext(rel);

        if CODE_EXTENSIONS.contains(&ext.as_str()) && dirs.iter().any(|d| SOURCE_DIRS.contains(&d.as_str())) {
            return Self::Code;
        }
        if dirs.iter().any(|d| DESIGN_DIRS.contains(&d.as_str())) {
            return Self::Design;
        }
        if dirs.iter().any(|d| DOC_DIRS.contains(&d.as_str())) {
            return Self::Doc;
        }
        Self::Generic
    }

    fn prefix(&self) -> &'static str {
        match self {
            Self::Doc => "doc",
            Self::Design => "design",
            Self::Code => "code",
            Self::Readme => "readme",
            Self::Generic => "file",
        }
    }

    fn root_dirs(&self) -> &'static [&'static str] {
        match self {
            Self::Doc => DOC_DIRS,
            Self::Design => DESIGN_DIRS,
            Self::Code => SOURCE_DIRS,
            Self::Readme | Self::Generic => &[],
        }
    }
}

/// Archive kind implied by a file's location. Outside source trees,
/// reflection, rule and archive directories override the category default.
pub fn infer_kind(rel: &Path, category: FileCategory) -> ArchiveKind {
    if category == FileCategory::Code {
        return ArchiveKind::Code;
    }
    let dirs = dir_names(rel);
    let has = |names: &[&str]| dirs.iter().any(|d| names.contains(&d.as_str()));

    if has(&["reflections", "reflection", "retros", "retrospectives"]) {
        ArchiveKind::Reflection
    } else if has(&["rules", ".cursor"]) || lower_ext(rel) == "mdc" {
        ArchiveKind::Rule
    } else if has(&["archive", "archives", "tasks", "completed"]) {
        ArchiveKind::Archive
    } else {
        match category {
            FileCategory::Code => ArchiveKind::Code,
            FileCategory::Doc | FileCategory::Design | FileCategory::Readme => ArchiveKind::Doc,
            FileCategory::Generic => ArchiveKind::Archive,
        }
    }
}

/// Id embedded in the file name, if any.
pub fn explicit_id(rel: &Path) -> Option<String> {
    let stem = rel.file_stem()?.to_str()?;
    EXPLICIT_ID
        .captures(stem)
        .map(|caps| caps[1].to_string())
}

/// Deterministic id for a file. Always satisfies the task-id charset and
/// length limit.
pub fn derive_task_id(rel: &Path, category: FileCategory) -> String {
    if let Some(id) = explicit_id(rel) {
        return id;
    }

    let dirs = dir_names(rel);
    let stem = normalize_segment(&lower_stem(rel));
    let ext = normalize_segment(&lower_ext(rel));
    let common = COMMON_NAMES.contains(&stem.as_str());

    let mut segments: Vec<String> = vec![category.prefix().to_string()];
    match category {
        FileCategory::Readme => {
            if dirs.is_empty() {
                segments.push("root".into());
            } else {
                segments.extend(dirs.iter().map(|d| normalize_segment(d)));
            }
        }
        FileCategory::Design if !common => segments.push(stem),
        FileCategory::Doc | FileCategory::Code | FileCategory::Design => {
            let parents = if common {
                &dirs[..]
            } else {
                below_root(&dirs, category.root_dirs())
            };
            segments.extend(parents.iter().map(|d| normalize_segment(d)));
            segments.push(stem);
            if category == FileCategory::Code && !ext.is_empty() {
                segments.push(ext);
            }
        }
        FileCategory::Generic => {
            segments.extend(dirs.iter().map(|d| normalize_segment(d)));
            segments.push(stem);
        }
    }

    segments.retain(|s| !s.is_empty());
    let id = segments.join(".");
    cap_length(id, rel)
}

/// Lowercase, map anything outside `[a-z0-9_-]` to `-`, collapse runs.
pub fn normalize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;
    for c in raw.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

fn below_root<'a>(dirs: &'a [String], roots: &[&str]) -> &'a [String] {
    // Deepest match, so `docs/api/docs/x.md` is relative to the inner `docs`.
    match dirs.iter().rposition(|d| roots.contains(&d.as_str())) {
        Some(i) => &dirs[i + 1..],
        None => dirs,
    }
}

fn cap_length(id: String, rel: &Path) -> String {
    if id.len() <= MAX_ID_LEN {
        return id;
    }
    let digest = Sha256::digest(rel.to_string_lossy().as_bytes());
    let hash: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    // Keep the tail, which carries the file name.
    let keep = MAX_ID_LEN - hash.len() - 1;
    let tail = &id[id.len() - keep..];
    format!("{hash}.{}", tail.trim_start_matches(['.', '-']))
}

fn dir_names(rel: &Path) -> Vec<String> {
    let parent = rel.parent().unwrap_or_else(|| Path::new(""));
    parent
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_lowercase()),
            _ => None,
        })
        .collect()
}

fn lower_stem(rel: &Path) -> String {
    rel.file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn lower_ext(rel: &Path) -> String {
    rel.extension()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}
