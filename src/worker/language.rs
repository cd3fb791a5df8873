//! Language detection by path and by source
//!
//! Path detection looks at the file name only. Source detection reads the
//! interpreter line and editor modelines (emacs `-*- mode: X -*-`, vim
//! `vim: set ft=X`) near the start or end of the file.

use serde::{Deserialize, Serialize};

/// Lines inspected at each end of a file for modelines
const MODELINE_SPAN: usize = 5;

/// Supported programming languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Rust,
    Python,
}

impl Language {
    /// Detect language from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "rs" => Some(Language::Rust),
            "py" | "pyw" | "pyi" => Some(Language::Python),
            _ => None,
        }
    }

    /// Parse a stored language label or editor mode name
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "rust" | "rs" => Some(Language::Rust),
            "python" | "python2" | "python3" | "py" => Some(Language::Python),
            _ => None,
        }
    }

    /// Stable label stored in the highlight language table
    pub fn label(&self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::Python => "python",
        }
    }

    /// Get the tree-sitter language for this language
    pub fn tree_sitter_language(&self) -> tree_sitter::Language {
        match self {
            Language::Rust => tree_sitter_rust::LANGUAGE.into(),
            Language::Python => tree_sitter_python::LANGUAGE.into(),
        }
    }

    /// Detect language from a repository path
    pub fn from_path(path: &str) -> Option<Self> {
        let name = path.rsplit('/').next().unwrap_or(path);
        match name {
            "SConstruct" | "SConscript" => return Some(Language::Python),
            _ => {}
        }
        let (stem, extension) = name.rsplit_once('.')?;
        if stem.is_empty() {
            return None;
        }
        Self::from_extension(extension)
    }

    /// Detect language from file contents
    pub fn from_source(source: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(source);
        let lines: Vec<&str> = text.lines().collect();

        if let Some(first) = lines.first() {
            if let Some(language) = from_interpreter_line(first) {
                return Some(language);
            }
        }

        let head = lines.iter().take(MODELINE_SPAN);
        let tail = lines
            .iter()
            .skip(lines.len().saturating_sub(MODELINE_SPAN).max(MODELINE_SPAN));
        head.chain(tail).find_map(|line| from_modeline(line))
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

fn from_interpreter_line(line: &str) -> Option<Language> {
    if line.starts_with("#![") {
        // inner attribute
        return Some(Language::Rust);
    }
    let command = line.strip_prefix("#!")?;
    let mut words = command.split_whitespace();
    let program = words.next()?;
    let program = program.rsplit('/').next().unwrap_or(program);
    let interpreter = if program == "env" {
        words.find(|w| !w.starts_with('-'))?
    } else {
        program
    };

    if interpreter.starts_with("python") {
        Some(Language::Python)
    } else if interpreter == "rust-script" || interpreter == "run-cargo-script" {
        Some(Language::Rust)
    } else {
        None
    }
}

fn from_modeline(line: &str) -> Option<Language> {
    if let Some(start) = line.find("-*-") {
        let rest = &line[start + 3..];
        if let Some(end) = rest.find("-*-") {
            let inner = &rest[..end];
            let mode = match inner.to_ascii_lowercase().find("mode:") {
                Some(pos) => inner[pos + 5..].split(';').next().unwrap_or(""),
                None if !inner.contains(':') => inner,
                None => "",
            };
            if let Some(language) = Language::from_label(mode) {
                return Some(language);
            }
        }
    }

    let lower = line.to_lowercase();
    let marker = ["vim:", "vi:", "ex:"]
        .iter()
        .find_map(|m| lower.find(m).map(|pos| pos + m.len()))?;
    let settings = &lower[marker..];
    for key in ["filetype=", "ft=", "syntax="] {
        if let Some(pos) = settings.find(key) {
            let value: String = settings[pos + key.len()..]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            if let Some(language) = Language::from_label(&value) {
                return Some(language);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_path() {
        assert_eq!(Language::from_path("src/main.rs"), Some(Language::Rust));
        assert_eq!(Language::from_path("tools/build.PY"), Some(Language::Python));
        assert_eq!(Language::from_path("SConstruct"), Some(Language::Python));
        assert_eq!(Language::from_path("bin/critic"), None);
        assert_eq!(Language::from_path(".rs"), None);
        assert_eq!(Language::from_path("README.md"), None);
    }

    #[test]
    fn test_shebang() {
        assert_eq!(
            Language::from_source(b"#!/usr/bin/env python3\nprint(1)\n"),
            Some(Language::Python)
        );
        assert_eq!(
            Language::from_source(b"#!/usr/bin/python -u\n"),
            Some(Language::Python)
        );
        assert_eq!(
            Language::from_source(b"#!/usr/bin/env rust-script\nfn main() {}\n"),
            Some(Language::Rust)
        );
        assert_eq!(Language::from_source(b"#!/bin/sh\necho hi\n"), None);
        assert_eq!(
            Language::from_source(b"#![allow(dead_code)]\nfn f() {}\n"),
            Some(Language::Rust)
        );
    }

    #[test]
    fn test_modelines() {
        assert_eq!(
            Language::from_source(b"# -*- mode: python; coding: utf-8 -*-\nx = 1\n"),
            Some(Language::Python)
        );
        assert_eq!(
            Language::from_source(b"# -*- python -*-\n"),
            Some(Language::Python)
        );
        let mut tail = b"fn main() {}\n".repeat(20);
        tail.extend_from_slice(b"// vim: set ft=rust ts=4:\n");
        assert_eq!(Language::from_source(&tail), Some(Language::Rust));
        assert_eq!(Language::from_source(b"plain text\n"), None);
    }

    #[test]
    fn test_labels_round_trip_through_display() {
        for language in [Language::Rust, Language::Python] {
            assert_eq!(Language::from_label(&language.to_string()), Some(language));
        }
    }
}
