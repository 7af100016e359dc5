//! Kernel module dependency graph.
//!
//! Built from the host's `modules.dep`, where each line names a module
//! object and its direct prerequisites:
//!
//! ```text
//! kernel/net/bridge/br_netfilter.ko.zst: kernel/net/bridge/bridge.ko.zst kernel/net/802/stp.ko.zst
//! kernel/net/bridge/bridge.ko.zst: kernel/net/802/stp.ko.zst kernel/net/llc/llc.ko.zst
//! ```
//!
//! Module names are the object basename without `.ko` and compression
//! suffixes, with `-` folded to `_` the way the kernel folds them.
//!
//! The graph is immutable once built and is shared between monitors.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rustix::system::uname;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("module not found: {0}")]
    NotFound(String),

    #[error("dependency cycle through {0}")]
    DependencyCycle(String),

    #[error("failed to read modules.dep: {0}")]
    Io(#[from] io::Error),
}

const MODULE_SUFFIXES: &[&str] = &[".ko.zst", ".ko.xz", ".ko.gz", ".ko"];

/// Canonical module name: `-` folded to `_`.
pub fn normalize_name(name: &str) -> String {
    name.replace('-', "_")
}

/// Module name of an object path such as `kernel/fs/fuse/fuse.ko.xz`.
pub fn module_name_from_path(path: &Path) -> Option<String> {
    let file = path.file_name()?.to_str()?;
    MODULE_SUFFIXES
        .iter()
        .find_map(|suffix| file.strip_suffix(suffix))
        .filter(|stem| !stem.is_empty())
        .map(normalize_name)
}

#[derive(Debug, Clone)]
struct ModuleEntry {
    path: PathBuf,
    deps: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleGraph {
    modules: HashMap<String, ModuleEntry>,
}

impl ModuleGraph {
    /// An empty graph; every lookup is `NotFound`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module with its direct prerequisites.
    pub fn insert<I, S>(&mut self, name: &str, path: impl Into<PathBuf>, deps: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.modules.insert(
            normalize_name(name),
            ModuleEntry {
                path: path.into(),
                deps: deps
                    .into_iter()
                    .map(|d| normalize_name(d.as_ref()))
                    .collect(),
            },
        );
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_module<I, S>(mut self, name: &str, path: impl Into<PathBuf>, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.insert(name, path, deps);
        self
    }

    /// Parse `modules.dep` text. Object paths are joined onto `base`.
    ///
    /// Lines that do not name a module object are skipped.
    pub fn parse_modules_dep(text: &str, base: &Path) -> Self {
        let mut graph = Self::new();
        for line in text.lines() {
            let Some((object, deps)) = line.split_once(':') else {
                continue;
            };
            let object = Path::new(object.trim());
            let Some(name) = module_name_from_path(object) else {
                continue;
            };
            let deps: Vec<String> = deps
                .split_whitespace()
                .filter_map(|d| module_name_from_path(Path::new(d)))
                .collect();
            graph.insert(&name, base.join(object), deps);
        }
        graph
    }

    pub fn from_file(path: &Path) -> Result<Self, GraphError> {
        let text = fs::read_to_string(path)?;
        let base = path.parent().unwrap_or(Path::new("/"));
        Ok(Self::parse_modules_dep(&text, base))
    }

    /// Load `/lib/modules/<release>/modules.dep` for the running kernel.
    pub fn for_running_kernel() -> Result<Self, GraphError> {
        let uts = uname();
        let release = uts.release().to_string_lossy();
        let path = PathBuf::from("/lib/modules")
            .join(release.as_ref())
            .join("modules.dep");
        tracing::debug!(path = %path.display(), "loading module dependency graph");
        Self::from_file(&path)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(&normalize_name(name))
    }

    /// Host path of the module object.
    pub fn path_of(&self, name: &str) -> Option<&Path> {
        self.modules
            .get(&normalize_name(name))
            .map(|m| m.path.as_path())
    }

    /// Load order for `name`: prerequisites first, each module once, `name` last.
    ///
    /// # Errors
    ///
    /// `NotFound` if `name` or any prerequisite is unknown, `DependencyCycle`
    /// if the prerequisites loop back on themselves.
    pub fn dependencies_of(&self, name: &str) -> Result<Vec<String>, GraphError> {
        let mut order = Vec::new();
        let mut visiting = HashSet::new();
        let mut visited = HashSet::new();
        self.visit(
            &normalize_name(name),
            &mut visiting,
            &mut visited,
            &mut order,
        )?;
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        visiting: &mut HashSet<String>,
        visited: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<(), GraphError> {
        if visited.contains(name) {
            return Ok(());
        }
        if !visiting.insert(name.to_string()) {
            return Err(GraphError::DependencyCycle(name.to_string()));
        }

        let entry = self
            .modules
            .get(name)
            .ok_or_else(|| GraphError::NotFound(name.to_string()))?;
        for dep in &entry.deps {
            self.visit(dep, visiting, visited, order)?;
        }

        visiting.remove(name);
        visited.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }
}
