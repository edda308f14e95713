//! `element.toml` project configuration (§6): search paths and a default
//! module name, loaded the way the teacher's `LintConfig::from_toml` loads
//! its own TOML file — one `Deserialize` struct, one `from_toml` entry
//! point, defaults applied via `serde(default)`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProjectConfig {
    /// Extra directories `load_element` consults after the importing
    /// file's own directory (§6 "Search paths").
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    /// File run when no FILE argument and no REPL-worthy stdin are given.
    #[serde(default)]
    pub entry: Option<PathBuf>,
}

impl ProjectConfig {
    pub fn from_toml(toml_str: &str) -> Result<Self, String> {
        toml::from_str(toml_str).map_err(|e| format!("failed to parse element.toml: {e}"))
    }

    /// Looks for `element.toml` next to `dir` (the entry file's directory,
    /// or the cwd for the REPL); absent is not an error, just the default.
    pub fn load_near(dir: &Path) -> Result<Self, String> {
        let path = dir.join("element.toml");
        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml(&contents),
            Err(_) => Ok(ProjectConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ProjectConfig::load_near(dir.path()).unwrap();
        assert!(cfg.search_paths.is_empty());
        assert!(cfg.entry.is_none());
    }

    #[test]
    fn parses_search_paths_and_entry() {
        let toml_str = r#"
            search_paths = ["./lib", "/opt/element/stdlib"]
            entry = "main.element"
        "#;
        let cfg = ProjectConfig::from_toml(toml_str).unwrap();
        assert_eq!(cfg.search_paths.len(), 2);
        assert_eq!(cfg.entry, Some(PathBuf::from("main.element")));
    }
}
