//! Filesystem `IMPORT` resolution (§6): a `<name>.jdb` file, looked up
//! in the current directory and alongside the main source file.

use anyhow::{bail, Context, Result};
use jdb_compiler::ModuleResolver;
use std::path::PathBuf;

pub struct FsResolver {
    search_dirs: Vec<PathBuf>,
}

impl FsResolver {
    pub fn new(source_dir: Option<&std::path::Path>) -> Self {
        let mut search_dirs = vec![PathBuf::from(".")];
        if let Some(dir) = source_dir {
            if !dir.as_os_str().is_empty() {
                search_dirs.push(dir.to_path_buf());
            }
        }
        Self { search_dirs }
    }
}

impl ModuleResolver for FsResolver {
    fn resolve(&self, module_name: &str) -> Result<String> {
        for dir in &self.search_dirs {
            let candidate = dir.join(format!("{module_name}.jdb"));
            if candidate.is_file() {
                return std::fs::read_to_string(&candidate)
                    .with_context(|| format!("reading module file {}", candidate.display()));
            }
        }
        bail!("module '{module_name}' not found (looked for {module_name}.jdb in {:?})", self.search_dirs)
    }
}
