//! Resolves `load_element(path)` requests to files on disk, memoizing by
//! canonical path so a module is only ever compiled and run once (§6).

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use element_core::value::Value;

/// Directory stack + explicit search path list + load cache. The directory
/// stack lets a relative `load_element("./util.element")` resolve against
/// the *importing* file's directory rather than the process cwd, even
/// several levels deep in a chain of imports.
pub struct ModuleLoader {
    directory_stack: RefCell<Vec<PathBuf>>,
    search_paths: RefCell<Vec<PathBuf>>,
    cache: RefCell<HashMap<PathBuf, Value>>,
}

impl ModuleLoader {
    pub fn new(entry_dir: PathBuf) -> Self {
        let mut search_paths = vec![entry_dir.clone()];
        if let Ok(exe) = std::env::current_exe() {
            if let Some(exe_dir) = exe.parent() {
                search_paths.push(exe_dir.join("..").join("stdlib"));
            }
        }
        ModuleLoader {
            directory_stack: RefCell::new(vec![entry_dir]),
            search_paths: RefCell::new(search_paths),
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn add_search_path(&self, path: impl Into<PathBuf>) {
        self.search_paths.borrow_mut().push(path.into());
    }

    fn candidate_path(base: &Path, requested: &str) -> PathBuf {
        let mut p = base.join(requested);
        if p.extension().is_none() {
            p.set_extension("element");
        }
        p
    }

    /// Tries the current directory first (so relative imports favor the
    /// importing file's own directory over any other registered path),
    /// then each registered search path in order.
    pub fn resolve(&self, requested: &str) -> Option<PathBuf> {
        let current_dir = self.directory_stack.borrow().last().cloned();
        if let Some(dir) = current_dir {
            let candidate = Self::candidate_path(&dir, requested);
            if candidate.is_file() {
                return candidate.canonicalize().ok().or(Some(candidate));
            }
        }
        for base in self.search_paths.borrow().iter() {
            let candidate = Self::candidate_path(base, requested);
            if candidate.is_file() {
                return candidate.canonicalize().ok().or(Some(candidate));
            }
        }
        None
    }

    pub fn cached_result(&self, path: &Path) -> Option<Value> {
        self.cache.borrow().get(path).copied()
    }

    pub fn cache_result(&self, path: &Path, result: Value) {
        self.cache.borrow_mut().insert(path.to_path_buf(), result);
    }

    /// Pushes `path`'s parent directory onto the resolution stack for the
    /// duration of loading it, so nested `load_element` calls made from
    /// within its body resolve relative to it rather than the outer
    /// caller's directory. Paired with `pop_directory`.
    pub fn push_directory_for(&self, path: &Path) {
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        self.directory_stack.borrow_mut().push(dir);
    }

    pub fn pop_directory(&self) {
        self.directory_stack.borrow_mut().pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolves_relative_to_entry_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("helper.element");
        std::fs::File::create(&file_path).unwrap().write_all(b"1;").unwrap();

        let loader = ModuleLoader::new(dir.path().to_path_buf());
        let resolved = loader.resolve("helper").expect("helper.element should resolve");
        assert_eq!(resolved.file_name().unwrap(), "helper.element");
    }

    #[test]
    fn missing_module_resolves_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ModuleLoader::new(dir.path().to_path_buf());
        assert!(loader.resolve("does_not_exist").is_none());
    }

    #[test]
    fn added_search_paths_are_consulted() {
        let entry_dir = tempfile::tempdir().unwrap();
        let lib_dir = tempfile::tempdir().unwrap();
        let file_path = lib_dir.path().join("util.element");
        std::fs::File::create(&file_path).unwrap().write_all(b"1;").unwrap();

        let loader = ModuleLoader::new(entry_dir.path().to_path_buf());
        loader.add_search_path(lib_dir.path().to_path_buf());
        assert!(loader.resolve("util").is_some());
    }
}
