//! Model registry: the set of loaded models, kept in sync with a directory.
//!
//! Readers take a snapshot of the name -> model map (`ArcSwap`); a refresh
//! builds the next map off to the side and swaps it in, so a prediction
//! never sees a half-replaced handle. Writers are serialized.
//!
//! A model's identity is `name_<ctime seconds>`. Replacing the file within
//! the same second as the previous write is not detected.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::engine::{EngineError, InferenceEngine, ModelHandle};
use crate::metrics::metrics;

/// Decimal megabyte, as used for the memory budget and `sizeMB`.
pub const BYTES_PER_MB: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct VersionTag(String);

impl VersionTag {
    pub fn new(name: &str, created_secs: i64) -> Self { Self(format!("{name}_{created_secs}")) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub name: String,
    pub size_bytes: u64,
    pub version: VersionTag,
}

impl ModelDescriptor {
    pub fn size_mb(&self) -> f64 { self.size_bytes as f64 / BYTES_PER_MB as f64 }
}

pub struct LoadedModel {
    name: String,
    version: VersionTag,
    path: PathBuf,
    size_bytes: u64,
    handle: Arc<dyn ModelHandle>,
}

impl LoadedModel {
    pub fn new(name: impl Into<String>, version: VersionTag, path: PathBuf, size_bytes: u64, handle: Arc<dyn ModelHandle>) -> Self {
        Self { name: name.into(), version, path, size_bytes, handle }
    }
    pub fn name(&self) -> &str { &self.name }
    pub fn version(&self) -> &VersionTag { &self.version }
    pub fn path(&self) -> &Path { &self.path }
    pub fn handle(&self) -> &Arc<dyn ModelHandle> { &self.handle }
    pub fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor { name: self.name.clone(), size_bytes: self.size_bytes, version: self.version.clone() }
    }
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("path", &self.path)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Total memory for models ({total} bytes) exceeds configured limit of {budget} bytes")]
    Oversize { total: u64, budget: u64 },
    #[error("filesystem error on {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to load model {name}: {source}")]
    Load { name: String, #[source] source: EngineError },
    #[error("model {0} not found")]
    NotFound(String),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RegistryError + '_ {
    move |source| RegistryError::Io { path: path.to_path_buf(), source }
}

/// Total size of regular files under `dir`, recursively, following links.
pub fn dir_size(dir: &Path) -> Result<u64, RegistryError> {
    let mut total = 0u64;
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            RegistryError::Io { path, source: e.into() }
        })?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(|e| {
                let path = entry.path().to_path_buf();
                RegistryError::Io { path, source: e.into() }
            })?.len();
        }
    }
    Ok(total)
}

/// Fail with `Oversize` when the directory does not fit the budget.
pub fn check_budget(dir: &Path, budget_bytes: u64) -> Result<u64, RegistryError> {
    let total = dir_size(dir)?;
    if total > budget_bytes {
        return Err(RegistryError::Oversize { total, budget: budget_bytes });
    }
    Ok(total)
}

/// Model name of a file: everything before the first `.`.
pub fn model_name(file_name: &str) -> &str {
    file_name.split('.').next().unwrap_or_default()
}

#[cfg(unix)]
fn created_secs(meta: &Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.ctime()
}

#[cfg(not(unix))]
fn created_secs(meta: &Metadata) -> i64 {
    meta.created()
        .or_else(|_| meta.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[derive(Debug)]
struct ModelFile {
    name: String,
    path: PathBuf,
    size_bytes: u64,
    version: VersionTag,
}

impl ModelFile {
    fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor { name: self.name.clone(), size_bytes: self.size_bytes, version: self.version.clone() }
    }
}

/// Regular files of `dir` sorted by file name, one per model name.
fn scan_dir(dir: &Path) -> Result<Vec<ModelFile>, RegistryError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        let path = entry.path();
        let meta = fs::metadata(&path).map_err(io_error(&path))?;
        if !meta.is_file() { continue; }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let name = model_name(&file_name);
        if name.is_empty() {
            debug!(file=%file_name, "skipping file without model name");
            continue;
        }
        files.push(ModelFile {
            name: name.to_string(),
            version: VersionTag::new(name, created_secs(&meta)),
            size_bytes: meta.len(),
            path,
        });
    }
    files.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    let mut seen = HashSet::new();
    files.retain(|f| {
        let first = seen.insert(f.name.clone());
        if !first { warn!(model=%f.name, path=%f.path.display(), "duplicate model name, keeping the first file"); }
        first
    });
    Ok(files)
}

type ModelMap = HashMap<String, Arc<LoadedModel>>;

pub struct ModelRegistry {
    engine: Arc<dyn InferenceEngine>,
    models: ArcSwap<ModelMap>,
    writer: Mutex<()>,
}

impl ModelRegistry {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self { engine, models: ArcSwap::from_pointee(HashMap::new()), writer: Mutex::new(()) }
    }

    pub fn get(&self, name: &str) -> Result<Arc<LoadedModel>, RegistryError> {
        self.models.load().get(name).cloned().ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Descriptors of the loaded models, sorted by name.
    pub fn list(&self) -> Vec<ModelDescriptor> {
        let mut out: Vec<_> = self.models.load().values().map(|m| m.descriptor()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize { self.models.load().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Synchronize with `dir`: load new or replaced files, drop models whose
    /// file is gone. Blocking; call from a blocking context.
    ///
    /// On a load failure the files processed earlier in the pass stay
    /// updated and nothing is evicted.
    pub fn refresh(&self, dir: &Path, budget_bytes: u64) -> Result<Vec<ModelDescriptor>, RegistryError> {
        let _writer = self.writer.lock();
        metrics().refresh_total.add(1, &[]);
        let result = self.refresh_locked(dir, budget_bytes);
        if result.is_err() { metrics().refresh_failures_total.add(1, &[]); }
        result
    }

    fn refresh_locked(&self, dir: &Path, budget_bytes: u64) -> Result<Vec<ModelDescriptor>, RegistryError> {
        let total = check_budget(dir, budget_bytes)?;
        let files = scan_dir(dir)?;
        let mut next: ModelMap = (**self.models.load()).clone();
        let mut descriptors = Vec::with_capacity(files.len());
        for file in &files {
            if let Err(e) = self.load_if_changed(&mut next, file) {
                self.models.store(Arc::new(next));
                return Err(e);
            }
            descriptors.push(file.descriptor());
        }
        let seen: HashSet<&str> = files.iter().map(|f| f.name.as_str()).collect();
        next.retain(|name, _| {
            let keep = seen.contains(name.as_str());
            if !keep {
                info!(model=%name, "model file removed, evicting");
                metrics().models_evicted_total.add(1, &[]);
            }
            keep
        });
        self.models.store(Arc::new(next));
        info!(dir=%dir.display(), models = descriptors.len(), total_bytes = total, "registry refreshed");
        Ok(descriptors)
    }

    /// Load (or reload) a single model by name without touching the others.
    pub fn refresh_one(&self, dir: &Path, budget_bytes: u64, name: &str) -> Result<ModelDescriptor, RegistryError> {
        let _writer = self.writer.lock();
        check_budget(dir, budget_bytes)?;
        let file = scan_dir(dir)?
            .into_iter()
            .find(|f| f.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let mut next: ModelMap = (**self.models.load()).clone();
        self.load_if_changed(&mut next, &file)?;
        self.models.store(Arc::new(next));
        Ok(file.descriptor())
    }

    fn load_if_changed(&self, models: &mut ModelMap, file: &ModelFile) -> Result<(), RegistryError> {
        if models.get(&file.name).is_some_and(|m| m.version == file.version) {
            return Ok(());
        }
        let started = Instant::now();
        let handle = self.engine.load(&file.path).map_err(|source| {
            warn!(model=%file.name, path=%file.path.display(), error=%source, "model load failed");
            RegistryError::Load { name: file.name.clone(), source }
        })?;
        info!(model=%file.name, version=%file.version, elapsed_ms = started.elapsed().as_millis() as u64, "model loaded");
        metrics().model_loads_total.add(1, &[]);
        models.insert(
            file.name.clone(),
            Arc::new(LoadedModel::new(file.name.clone(), file.version.clone(), file.path.clone(), file.size_bytes, handle)),
        );
        Ok(())
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry").field("models", &self.list()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stub::StubEngine;
    use std::time::Duration;

    fn write_model(dir: &Path, file: &str, len: u64) {
        let f = fs::File::create(dir.join(file)).unwrap();
        f.set_len(len).unwrap();
    }

    fn registry() -> (Arc<StubEngine>, ModelRegistry) {
        let engine = StubEngine::new();
        let registry = ModelRegistry::new(engine.clone());
        (engine, registry)
    }

    const BUDGET: u64 = 64 * BYTES_PER_MB;

    #[test]
    fn model_name_is_prefix_before_first_dot() {
        assert_eq!(model_name("churn.cbm"), "churn");
        assert_eq!(model_name("churn.v2.json"), "churn");
        assert_eq!(model_name("plain"), "plain");
        assert_eq!(model_name(".hidden"), "");
    }

    #[test]
    fn refresh_loads_and_describes_each_file_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "b.json", 2_500_000);
        write_model(dir.path(), "a.json", 10);
        fs::create_dir(dir.path().join("nested")).unwrap();
        write_model(dir.path(), ".hidden", 1);
        let (engine, registry) = registry();

        let out = registry.refresh(dir.path(), BUDGET).unwrap();
        let names: Vec<_> = out.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(engine.loads(), 2);
        assert_eq!(out[1].size_mb(), 2.5);
        assert!(out[0].version.as_str().starts_with("a_"));
        assert_eq!(registry.get("a").unwrap().version(), &out[0].version);
    }

    #[test]
    fn refresh_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "a.json", 10);
        write_model(dir.path(), "b.json", 10);
        let (engine, registry) = registry();
        let first = registry.refresh(dir.path(), BUDGET).unwrap();
        let second = registry.refresh(dir.path(), BUDGET).unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.loads(), 2, "unchanged files are not reloaded");
    }

    #[test]
    fn replaced_file_is_reloaded_once() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "a.json", 10);
        write_model(dir.path(), "b.json", 10);
        let (engine, registry) = registry();
        let before = registry.refresh(dir.path(), BUDGET).unwrap();
        let old_b = registry.get("b").unwrap();

        // identity has second granularity
        std::thread::sleep(Duration::from_millis(1100));
        fs::remove_file(dir.path().join("a.json")).unwrap();
        fs::write(dir.path().join("a.json"), b"replaced").unwrap();

        let after = registry.refresh(dir.path(), BUDGET).unwrap();
        assert_eq!(engine.loads(), 3);
        assert_ne!(before[0].version, after[0].version);
        assert_eq!(before[1].version, after[1].version);
        assert!(Arc::ptr_eq(&old_b, &registry.get("b").unwrap()));
    }

    #[test]
    fn removed_file_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "a.json", 10);
        write_model(dir.path(), "b.json", 10);
        let (_engine, registry) = registry();
        registry.refresh(dir.path(), BUDGET).unwrap();
        fs::remove_file(dir.path().join("b.json")).unwrap();
        let out = registry.refresh(dir.path(), BUDGET).unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(registry.get("b"), Err(RegistryError::NotFound(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn oversize_directory_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "a.json", 6 * BYTES_PER_MB);
        write_model(dir.path(), "b.json", 6 * BYTES_PER_MB);
        let (engine, registry) = registry();
        let err = registry.refresh(dir.path(), 10 * BYTES_PER_MB).unwrap_err();
        assert!(matches!(err, RegistryError::Oversize { total: 12_000_000, budget: 10_000_000 }));
        assert!(registry.is_empty());
        assert_eq!(engine.loads(), 0);
    }

    #[test]
    fn nested_files_count_toward_budget() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "a.json", 10);
        fs::create_dir(dir.path().join("archive")).unwrap();
        write_model(&dir.path().join("archive"), "old.json", 100);
        assert_eq!(dir_size(dir.path()).unwrap(), 110);
        let (_engine, registry) = registry();
        assert!(matches!(registry.refresh(dir.path(), 50), Err(RegistryError::Oversize { .. })));
    }

    #[test]
    fn load_failure_keeps_earlier_updates_and_skips_eviction() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "stale.json", 10);
        let (engine, registry) = registry();
        registry.refresh(dir.path(), BUDGET).unwrap();
        fs::remove_file(dir.path().join("stale.json")).unwrap();

        write_model(dir.path(), "a.json", 10);
        write_model(dir.path(), "b.json", 10);
        write_model(dir.path(), "c.json", 10);
        engine.fail_file("b.json");
        let err = registry.refresh(dir.path(), BUDGET).unwrap_err();
        assert!(matches!(err, RegistryError::Load { ref name, .. } if name == "b"));
        assert!(registry.get("a").is_ok());
        assert!(registry.get("c").is_err(), "processing stops at the failing file");
        assert!(registry.get("stale").is_ok(), "no eviction in a failed pass");
    }

    #[test]
    fn duplicate_names_keep_first_file() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "m.cbm", 10);
        write_model(dir.path(), "m.json", 20);
        let (engine, registry) = registry();
        let out = registry.refresh(dir.path(), BUDGET).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].size_bytes, 10);
        assert_eq!(engine.loads(), 1);
        assert!(registry.get("m").unwrap().path().ends_with("m.cbm"));
    }

    #[test]
    fn refresh_one_leaves_other_models_alone() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "a.json", 10);
        let (engine, registry) = registry();
        registry.refresh(dir.path(), BUDGET).unwrap();
        fs::remove_file(dir.path().join("a.json")).unwrap();
        write_model(dir.path(), "b.json", 10);

        let d = registry.refresh_one(dir.path(), BUDGET, "b").unwrap();
        assert_eq!(d.name, "b");
        assert_eq!(engine.loads(), 2);
        assert!(registry.get("a").is_ok());
        assert_eq!(registry.list().iter().map(|d| d.name.clone()).collect::<Vec<_>>(), ["a", "b"]);
        assert!(matches!(registry.refresh_one(dir.path(), BUDGET, "zzz"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_engine, registry) = registry();
        let err = registry.refresh(&dir.path().join("nope"), BUDGET).unwrap_err();
        assert!(matches!(err, RegistryError::Io { .. }));
    }
}
