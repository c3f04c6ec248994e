use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are policed; anything else in the checkout is not ours.
const SOURCE_DIRS: [&str; 4] = ["engine", "src", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

/// The kinds of violation this script reports, each with its own remedy.
#[derive(Clone, Copy)]
enum Policy {
    UnderscorePrefix,
    ForbiddenWords,
    StarsInComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Policy {
    fn pattern(self) -> String {
        match self {
            Policy::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Policy::ForbiddenWords => format!(r"(//|/\*|///).*(?:{})", FORBIDDEN_WORDS.join("|")),
            Policy::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Policy::UppercaseComment => r"(//|/\*|///).*".to_string(),
            Policy::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn remedy(self) -> &'static str {
        match self {
            Policy::UnderscorePrefix => {
                "Underscore-prefixed variable names are not allowed in this project.\n   Either use the variable (removing the underscore) or remove it completely."
            }
            Policy::ForbiddenWords => {
                "Change-log style words in comments are STRICTLY FORBIDDEN in this project.\n   Describe what the code does, not how it got there."
            }
            Policy::StarsInComment => {
                "The '**' pattern is not allowed in regular comments (but is allowed in doc comments)."
            }
            Policy::UppercaseComment => {
                "Comments where all alphabetic characters are uppercase are STRICTLY FORBIDDEN in this project."
            }
            Policy::AllowDeadCode => {
                "#[allow(dead_code)] attributes are STRICTLY FORBIDDEN in this project.\n   Either use the code (removing the attribute) or remove it completely."
            }
        }
    }
}

// A custom "Sink" for the grep searcher. It collects all matching lines
// from a single file to build a comprehensive error message.
struct ViolationCollector {
    policy: Policy,
    violations: Vec<String>,
    file_path: PathBuf,
}

impl ViolationCollector {
    fn new(policy: Policy, file_path: &Path) -> Self {
        Self {
            policy,
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    // Decides whether a matched line is a real violation for this collector's policy.
    fn is_violation(&self, line_text: &str) -> bool {
        match self.policy {
            Policy::UnderscorePrefix => !is_comment(line_text) && !is_in_string(line_text),
            Policy::StarsInComment => !is_doc_comment(line_text),
            Policy::UppercaseComment => comment_text(line_text).is_some_and(|text| {
                let alpha_chars: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
                !alpha_chars.is_empty() && alpha_chars.iter().all(|c| c.is_uppercase())
            }),
            Policy::ForbiddenWords | Policy::AllowDeadCode => true,
        }
    }

    // After searching, this method checks if any violations were found.
    // If so, it formats a detailed error message and returns it.
    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} policy violations in {}:\n",
            self.violations.len(),
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.policy.remedy()));
        Some(error_msg)
    }
}

// The `matched` method is called by the searcher for every line that matches the regex.
impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if self.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }

        // Return `Ok(true)` to continue searching for more matches in the same file.
        Ok(true)
    }
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

// If the underscore variable is between quotes, it's in a string.
fn is_in_string(line: &str) -> bool {
    line.split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

// Extracts just the comment part of a line, without its `//`, `///` or `/*` prefix.
fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        Some(rest.trim())
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        Some(rest.trim())
    } else if let Some(idx) = line.find("/*") {
        let rest = &line[idx + 2..];
        Some(rest.find("*/").map_or(rest, |end| &rest[..end]).trim())
    } else {
        None
    }
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS.into_iter().flat_map(|dir| {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok()) // Ignore any errors during directory traversal.
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.into_path())
    })
}

fn scan(policy: Policy) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&policy.pattern())?;
    let mut searcher = Searcher::new();

    for path in rust_sources() {
        let mut collector = ViolationCollector::new(policy, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    // Always rerun this script if the build script itself or any policed source changes.
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    for policy in [
        Policy::UnderscorePrefix,
        Policy::ForbiddenWords,
        Policy::StarsInComment,
        Policy::UppercaseComment,
        Policy::AllowDeadCode,
    ] {
        if let Err(e) = scan(policy) {
            // The `eprintln!` here is crucial for showing the error in `cargo`'s output.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
