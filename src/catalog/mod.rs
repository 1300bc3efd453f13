//! Service catalog.
//!
//! Scans interface directories for `.proto` files and compiles them at
//! runtime into a `DescriptorPool`. Readers take a snapshot; a reload swaps
//! the snapshot wholesale so that a registration in progress keeps seeing
//! the namespace it started with.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use prost_reflect::{DescriptorPool, ServiceDescriptor};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::codec::JsonMapping;
use crate::config::{absolute, ProtoOptions};

/// An immutable compiled namespace.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pool: DescriptorPool,
    mapping: JsonMapping,
    generation: u64,
}

impl CatalogSnapshot {
    /// Resolve a fully-qualified service name.
    pub fn resolve(&self, name: &str) -> Result<ServiceDescriptor, CatalogError> {
        self.pool
            .get_service_by_name(name)
            .ok_or_else(|| CatalogError::ServiceNotFound(name.to_string()))
    }

    /// JSON mapping derived from the proto options this snapshot was built with.
    pub fn mapping(&self) -> &JsonMapping {
        &self.mapping
    }

    /// Load counter value at the time this snapshot was built.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Underlying descriptor pool.
    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }
}

/// Reloadable registry of compiled service descriptors.
#[derive(Debug, Default)]
pub struct ServiceCatalog {
    current: RwLock<Option<Arc<CatalogSnapshot>>>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan and compile interface files.
    ///
    /// Returns immediately if a namespace is already loaded and `reload` is false.
    pub fn load(
        &self,
        dirs: &[PathBuf],
        options: &ProtoOptions,
        reload: bool,
    ) -> Result<Arc<CatalogSnapshot>, CatalogError> {
        if !reload {
            if let Some(snapshot) = self.snapshot() {
                return Ok(snapshot);
            }
        }

        let generation = self.generation() + 1;
        let pool = compile(dirs, &options.include_dirs)?;
        let snapshot = Arc::new(CatalogSnapshot {
            pool,
            mapping: JsonMapping::from(options),
            generation,
        });

        let mut current = self
            .current
            .write()
            .map_err(|_| CatalogError::Compile("catalog lock poisoned".to_string()))?;
        *current = Some(snapshot.clone());

        info!(
            generation,
            services = snapshot.pool.services().count(),
            "Service catalog loaded"
        );
        Ok(snapshot)
    }

    /// Current snapshot, if any namespace has been loaded.
    pub fn snapshot(&self) -> Option<Arc<CatalogSnapshot>> {
        self.current.read().ok().and_then(|guard| guard.clone())
    }

    /// Resolve a fully-qualified service name against the current namespace.
    pub fn resolve(&self, name: &str) -> Result<ServiceDescriptor, CatalogError> {
        self.snapshot()
            .ok_or(CatalogError::NotLoaded)?
            .resolve(name)
    }

    /// Number of successful loads so far.
    pub fn generation(&self) -> u64 {
        self.snapshot().map(|s| s.generation).unwrap_or(0)
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot().is_some()
    }
}

/// Recursively collect `.proto` files below each dir.
///
/// Returned paths are relative to the dir they were found in, which is also
/// how they are named to the compiler.
pub fn scan(dirs: &[PathBuf]) -> Result<Vec<(PathBuf, PathBuf)>, CatalogError> {
    let mut found = Vec::new();
    for dir in dirs {
        let root = absolute(dir);
        if !root.is_dir() {
            return Err(CatalogError::Scan {
                path: root,
                reason: "not a directory".to_string(),
            });
        }

        for entry in WalkDir::new(&root).follow_links(true) {
            let entry = entry.map_err(|e| CatalogError::Scan {
                path: root.clone(),
                reason: e.to_string(),
            })?;
            let path = entry.path();
            if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == "proto") {
                if let Ok(relative) = path.strip_prefix(&root) {
                    found.push((root.clone(), relative.to_path_buf()));
                }
            }
        }
    }
    Ok(found)
}

fn compile(dirs: &[PathBuf], include_dirs: &[PathBuf]) -> Result<DescriptorPool, CatalogError> {
    let files = scan(dirs)?;

    let mut roots: Vec<PathBuf> = Vec::new();
    for root in dirs.iter().chain(include_dirs).map(|d| absolute(d)) {
        if !roots.contains(&root) {
            roots.push(root);
        }
    }

    let names: BTreeSet<&Path> = files.iter().map(|(_, name)| name.as_path()).collect();
    debug!(files = names.len(), roots = roots.len(), "Compiling interface files");

    let mut compiler = protox::Compiler::new(&roots)
        .map_err(|e| CatalogError::Compile(e.to_string()))?;
    compiler.include_imports(true);
    compiler
        .open_files(names)
        .map_err(|e| CatalogError::Compile(e.to_string()))?;

    Ok(compiler.descriptor_pool())
}

/// Catalog errors.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to scan '{}': {reason}", path.display())]
    Scan { path: PathBuf, reason: String },

    #[error("Failed to compile interface files: {0}")]
    Compile(String),

    #[error("Service catalog not loaded")]
    NotLoaded,

    #[error("Service '{0}' not found")]
    ServiceNotFound(String),
}
