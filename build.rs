use std::path::{Path, PathBuf};
use std::process::Command;

const MAX_LINES: usize = 750;

const SOURCE_DIRS: &[&str] = &["src"];

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/main");
    println!("cargo:rerun-if-changed=.git/packed-refs");

    let sha = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                String::from_utf8(output.stdout)
                    .ok()
                    .map(|s| s.trim().to_string())
            } else {
                None
            }
        })
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=EDGEFLOW_GIT_SHA={}", sha);

    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR must be set");
    let root = PathBuf::from(&manifest_dir);
    let files = collect_rust_files(&root);
    for file in &files {
        println!("cargo:rerun-if-changed={}", file.display());
    }

    enforce_line_limits(&root, &files);
    enforce_no_dead_code_allows(&root, &files);
}

fn collect_rust_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for dir in SOURCE_DIRS {
        walk_directory(&root.join(dir), &mut files);
    }
    files.sort();
    files
}

fn walk_directory(dir: &Path, files: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_directory(&path, files);
        } else if path.extension().and_then(|e| e.to_str()) == Some("rs") {
            files.push(path);
        }
    }
}

fn count_non_empty_lines(content: &str) -> usize {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count()
}

fn enforce_line_limits(root: &Path, files: &[PathBuf]) {
    let mut violations = Vec::new();
    for file in files {
        match std::fs::read_to_string(file) {
            Ok(content) => {
                let line_count = count_non_empty_lines(&content);
                if line_count > MAX_LINES {
                    let rel_path = file.strip_prefix(root).unwrap_or(file);
                    violations.push((rel_path.to_path_buf(), line_count));
                }
            }
            Err(e) => {
                let rel_path = file.strip_prefix(root).unwrap_or(file);
                println!(
                    "cargo:warning=Could not read file {}: {}",
                    rel_path.display(),
                    e
                );
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n========================================");
        eprintln!("FILE LINE LIMIT EXCEEDED (max {} lines)", MAX_LINES);
        eprintln!("========================================");
        for (path, lines) in &violations {
            eprintln!(
                "  {} - {} lines (exceeds by {})",
                path.display(),
                lines,
                lines - MAX_LINES
            );
        }
        eprintln!("========================================\n");
        eprintln!("Please split these files into smaller modules.\n");
        panic!(
            "Build failed: {} file(s) exceed the {} line limit",
            violations.len(),
            MAX_LINES
        );
    }
}

fn enforce_no_dead_code_allows(root: &Path, files: &[PathBuf]) {
    let mut violations: Vec<(PathBuf, usize, String)> = Vec::new();

    for file in files {
        let Ok(content) = std::fs::read_to_string(file) else {
            continue;
        };
        for (line_num, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if (trimmed.starts_with("#[allow(") || trimmed.starts_with("#![allow("))
                && trimmed.contains("dead_code")
            {
                let rel_path = file.strip_prefix(root).unwrap_or(file).to_path_buf();
                violations.push((rel_path, line_num + 1, trimmed.to_string()));
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n========================================");
        eprintln!("#[allow(dead_code)] IS NOT ALLOWED");
        eprintln!("========================================");
        for (path, line_num, line_content) in &violations {
            eprintln!("  {}:{}", path.display(), line_num);
            eprintln!("    {}", line_content);
        }
        eprintln!("========================================");
        eprintln!("Delete unused code, or gate test-only code with #[cfg(test)].");
        eprintln!("========================================\n");
        panic!(
            "Build failed: {} #[allow(dead_code)] occurrence(s) found. Remove the dead code.",
            violations.len()
        );
    }
}
