//! Turn source files into embeddable documents.
//!
//! Small files are embedded verbatim under a short header. Large files are
//! reduced to their structure: imports, type declarations and function
//! signatures, each list capped, so embedding cost stays bounded.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Entries kept per list in a structural summary.
pub const LIST_CAP: usize = 25;
const SIGNATURE_MAX_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Rust,
    Python,
    TypeScript,
    JavaScript,
    Go,
    Java,
    C,
    Cpp,
    Ruby,
    Swift,
    Other,
}

impl Language {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "rs" => Self::Rust,
            "py" => Self::Python,
            "ts" | "tsx" => Self::TypeScript,
            "js" | "jsx" | "mjs" => Self::JavaScript,
            "go" => Self::Go,
            "java" | "kt" => Self::Java,
            "c" | "h" => Self::C,
            "cpp" | "cc" | "cxx" | "hpp" | "hh" => Self::Cpp,
            "rb" => Self::Ruby,
            "swift" => Self::Swift,
            _ => Self::Other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::TypeScript => "typescript",
            Self::JavaScript => "javascript",
            Self::Go => "go",
            Self::Java => "java",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::Ruby => "ruby",
            Self::Swift => "swift",
            Self::Other => "text",
        }
    }

    fn rules(&self) -> Option<&'static Rules> {
        match self {
            Self::Rust => Some(&RUST),
            Self::Python => Some(&PYTHON),
            Self::TypeScript | Self::JavaScript => Some(&ECMASCRIPT),
            Self::Go => Some(&GO),
            Self::Java => Some(&JAVA),
            Self::C => Some(&C),
            Self::Cpp => Some(&CPP),
            Self::Ruby => Some(&RUBY),
            Self::Swift => Some(&SWIFT),
            Self::Other => None,
        }
    }
}

struct Rules {
    imports: Regex,
    types: Regex,
    functions: Regex,
}

fn rules(imports: &str, types: &str, functions: &str) -> Rules {
    let build = |pattern: &str| Regex::new(&format!("(?m){pattern}")).expect("valid regex");
    Rules {
        imports: build(imports),
        types: build(types),
        functions: build(functions),
    }
}

static RUST: LazyLock<Rules> = LazyLock::new(|| {
    rules(
        r"^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+[^;]+;",
        r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait|type|union)\s+\w+",
        r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?(?:extern\s+\S+\s+)?fn\s+\w+[^{;]*",
    )
});

static PYTHON: LazyLock<Rules> = LazyLock::new(|| {
    rules(
        r"^\s*(?:from\s+\S+\s+import\s+.+|import\s+.+)$",
        r"^\s*class\s+\w+[^:]*",
        r"^\s*(?:async\s+)?def\s+\w+\s*\([^)]*\)?[^:]*",
    )
});

static ECMASCRIPT: LazyLock<Rules> = LazyLock::new(|| {
    rules(
        r#"^\s*(?:import\s+.+|(?:const|let|var)\s+.+=\s*require\(.+\).*)$"#,
        r"^\s*(?:export\s+)?(?:default\s+)?(?:declare\s+)?(?:abstract\s+)?(?:class|interface|type|enum)\s+\w+",
        r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:function\s*\*?\s*\w+\s*\([^)]*\)?|(?:const|let)\s+\w+\s*=\s*(?:async\s*)?(?:\([^)]*\)|\w+)\s*=>)",
    )
});

static GO: LazyLock<Rules> = LazyLock::new(|| {
    rules(
        r#"^\s*(?:import\s+(?:\w+\s+)?"[^"]+"|(?:\w+\s+)?"[^"]+"\s*$)"#,
        r"^\s*type\s+\w+\s+(?:struct|interface)",
        r"^func\s+[^{]*",
    )
});

static JAVA: LazyLock<Rules> = LazyLock::new(|| {
    rules(
        r"^\s*import\s+(?:static\s+)?[\w.*]+;",
        r"^\s*(?:(?:public|private|protected|abstract|final|static|sealed)\s+)*(?:class|interface|enum|record)\s+\w+",
        r"^\s+(?:(?:public|private|protected|static|final|abstract|synchronized)\s+)+[\w<>\[\], ?]+\s+\w+\s*\([^)]*\)",
    )
});

// Function definitions start in column 0 with a return type; indented calls
// and control flow never match.
static C: LazyLock<Rules> = LazyLock::new(|| {
    rules(
        r#"^\s*#\s*include\s*[<"][^>"]+[>"]"#,
        r"^\s*(?:typedef\s+)?(?:struct|union|enum)\s+\w+|^\s*typedef\s+[^;{(]+;",
        r"^(?:[A-Za-z_][\w\*]*[ \t\*]+)+\**[A-Za-z_]\w*\s*\([^;{)]*\)\s*\{",
    )
});

static CPP: LazyLock<Rules> = LazyLock::new(|| {
    rules(
        r#"^\s*(?:#\s*include\s*[<"][^>"]+[>"]|using\s+namespace\s+[\w:]+;)"#,
        r"^\s*(?:template\s*<[^>]*>\s*)?(?:class|struct|union|enum(?:\s+class)?)\s+\w+|^\s*typedef\s+[^;{(]+;",
        r"^(?:[A-Za-z_][\w:<>,\*&]*[ \t\*&]+)+[\*&]*(?:[A-Za-z_]\w*::)*~?[A-Za-z_]\w*\s*\([^;{)]*\)[^;{]*\{",
    )
});

static RUBY: LazyLock<Rules> = LazyLock::new(|| {
    rules(
        r#"^\s*(?:require|require_relative|load)\s*\(?\s*['"][^'"]+['"]"#,
        r"^\s*(?:class|module)\s+[A-Z][\w:]*(?:\s*<\s*[\w:]+)?",
        r"^\s*def\s+(?:self\.)?[\w?!=\[\]]+(?:\s*\([^)]*\))?",
    )
});

static SWIFT: LazyLock<Rules> = LazyLock::new(|| {
    rules(
        r"^\s*(?:@testable[ \t]+)?import[ \t]+(?:(?:typealias|struct|class|enum|protocol|let|var|func)[ \t]+)?[\w.]+",
        r"^\s*(?:(?:public|private|fileprivate|internal|open|final|indirect)\s+)*(?:class|struct|enum|protocol|extension|actor)\s+\w+",
        r"^\s*(?:@\w+\s+)*(?:(?:public|private|fileprivate|internal|open|final|static|class|override|mutating|nonmutating)\s+)*func\s+\w+\s*(?:<[^>]*>)?\s*\([^)]*\)[^{\n]*",
    )
});

/// Structural metadata of one file.
#[derive(Debug, Clone, Default)]
pub struct CodeOutline {
    pub imports: Vec<String>,
    pub types: Vec<String>,
    pub functions: Vec<String>,
}

pub fn outline(content: &str, language: Language) -> CodeOutline {
    let Some(rules) = language.rules() else {
        return CodeOutline::default();
    };
    let collect = |re: &Regex| -> Vec<String> {
        re.find_iter(content)
            .map(|m| clean_signature(m.as_str()))
            .filter(|s| !s.is_empty())
            .collect()
    };
    CodeOutline {
        imports: collect(&rules.imports),
        types: collect(&rules.types),
        functions: collect(&rules.functions),
    }
}

/// Build the text stored for a source file.
pub fn code_document(rel: &Path, content: &str, threshold: usize) -> String {
    let language = Language::from_path(rel);
    let lines = content.lines().count();
    let header = format!(
        "# {}\n\nLanguage: {} | Lines: {} | Bytes: {}\n",
        rel.display(),
        language.name(),
        lines,
        content.len()
    );

    if content.len() <= threshold {
        return format!("{header}\n```{}\n{}\n```\n", language.name(), content.trim_end());
    }

    let outline = outline(content, language);
    let mut doc = header;
    doc.push_str("\nLarge file: structural summary only.\n");
    push_section(&mut doc, "Imports", &outline.imports);
    push_section(&mut doc, "Types", &outline.types);
    push_section(&mut doc, "Functions", &outline.functions);
    doc
}

fn push_section(doc: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    doc.push_str(&format!("\n## {title} ({})\n\n", items.len()));
    for item in items.iter().take(LIST_CAP) {
        doc.push_str("- `");
        doc.push_str(item);
        doc.push_str("`\n");
    }
    if items.len() > LIST_CAP {
        doc.push_str(&format!("- ... and {} more\n", items.len() - LIST_CAP));
    }
}

fn clean_signature(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_end_matches(['{', ' ']).replace('`', "'");
    match trimmed.char_indices().nth(SIGNATURE_MAX_CHARS) {
        Some((i, _)) => format!("{}...", &trimmed[..i]),
        None => trimmed,
    }
}
