//! Budgeted re-sharding of a parameter collection.
//!
//! Source files are memory-mapped and walked in stored order; parameters are
//! copied out one at a time into the shard being built, so only the current
//! output shard is ever held in memory. Packing is greedy and order-preserving:
//! a shard is flushed as soon as the next parameter would push it past the
//! budget. A parameter larger than the budget gets a shard of its own.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::store::{for_each_parameter, list_parameter_files, read_shard, write_shard};
use crate::{MergeError, Parameter, ParameterMap, Result, Stage};

/// One budget-bounded shard on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFile {
    index: usize,
    path: PathBuf,
    names: Vec<String>,
    bytes: usize,
}

impl ShardFile {
    /// Position in the shard sequence (`partN`).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Location of the shard file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parameter names held by this shard, in order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Sum of parameter buffer sizes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Load the shard's parameters.
    pub fn load(&self) -> Result<ParameterMap> {
        read_shard(&self.path)
    }
}

/// The ordered shards produced from one source collection.
#[derive(Debug, Clone)]
pub struct ShardSet {
    dir: PathBuf,
    budget: usize,
    shards: Vec<ShardFile>,
}

impl ShardSet {
    /// Scratch directory holding the shards.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Budget the set was split with.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Shards in index order.
    pub fn shards(&self) -> &[ShardFile] {
        &self.shards
    }

    /// Shard at `index`.
    pub fn get(&self, index: usize) -> Option<&ShardFile> {
        self.shards.get(index)
    }

    /// Number of shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether the set has no shards.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Number of parameters across all shards.
    pub fn num_parameters(&self) -> usize {
        self.shards.iter().map(|s| s.names.len()).sum()
    }

    /// Size of the largest shard, which bounds resident memory per shard.
    pub fn max_shard_bytes(&self) -> usize {
        self.shards.iter().map(|s| s.bytes).max().unwrap_or(0)
    }

    /// Delete the scratch directory.
    pub fn remove(self) -> Result<()> {
        std::fs::remove_dir_all(&self.dir).map_err(|e| MergeError::scratch(&self.dir, Stage::Assemble, e))
    }
}

/// Greedy, order-preserving shard splitter.
#[derive(Debug, Clone, Copy)]
pub struct ShardSplitter {
    budget: usize,
}

impl ShardSplitter {
    /// Create a splitter with a per-shard byte budget.
    pub fn new(budget: u64) -> Self {
        Self {
            budget: usize::try_from(budget).unwrap_or(usize::MAX),
        }
    }

    /// Byte budget per shard.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Re-shard every parameter file under `source` into `scratch`.
    ///
    /// `scratch` is deleted and recreated first; it must not be shared with
    /// another running merge.
    pub fn split(&self, source: impl AsRef<Path>, scratch: impl AsRef<Path>) -> Result<ShardSet> {
        let source = source.as_ref();
        let scratch = scratch.as_ref();

        let files = list_parameter_files(source)?;
        check_scratch_disjoint(scratch, &[source])?;
        prepare_scratch(scratch)?;

        info!(
            "Splitting {} source files from {:?} into {:?} (budget {} bytes)",
            files.len(),
            source,
            scratch,
            self.budget
        );

        let mut acc = Accumulator::new(scratch, self.budget);

        for file_path in &files {
            debug!("Reading {:?}", file_path);
            let file = File::open(file_path).map_err(|e| MergeError::scratch(file_path, Stage::Split, e))?;
            // SAFETY: The file is opened read-only and the mapping does not
            // outlive this loop iteration.
            #[allow(unsafe_code)]
            let mmap = unsafe { memmap2::Mmap::map(&file) }
                .map_err(|e| MergeError::scratch(file_path, Stage::Split, e))?;

            let count = for_each_parameter(&mmap, |param| acc.push(param))?;
            if count == 0 {
                return Err(MergeError::DegenerateInput {
                    path: file_path.clone(),
                });
            }
        }

        acc.flush()?;

        info!("Split {:?} into {} shards", source, acc.shards.len());
        Ok(ShardSet {
            dir: scratch.to_path_buf(),
            budget: self.budget,
            shards: acc.shards,
        })
    }
}

/// Refuse scratch locations that would wipe an input when cleared.
pub(crate) fn check_scratch_disjoint(scratch: &Path, inputs: &[&Path]) -> Result<()> {
    let Ok(scratch) = scratch.canonicalize() else {
        // Not created yet, so it cannot contain an input.
        return Ok(());
    };
    for input in inputs {
        let input = input
            .canonicalize()
            .map_err(|e| MergeError::scratch(*input, Stage::Setup, e))?;
        if input.starts_with(&scratch) {
            return Err(MergeError::InvalidConfig(format!(
                "scratch directory {:?} contains input {:?}",
                scratch, input
            )));
        }
    }
    Ok(())
}

fn prepare_scratch(scratch: &Path) -> Result<()> {
    if scratch.exists() {
        debug!("Clearing scratch directory {:?}", scratch);
        std::fs::remove_dir_all(scratch).map_err(|e| MergeError::scratch(scratch, Stage::Split, e))?;
    }
    std::fs::create_dir_all(scratch).map_err(|e| MergeError::scratch(scratch, Stage::Split, e))
}

/// The shard currently being filled.
struct Accumulator<'a> {
    scratch: &'a Path,
    budget: usize,
    current: ParameterMap,
    shards: Vec<ShardFile>,
    seen: HashSet<String>,
}

impl<'a> Accumulator<'a> {
    fn new(scratch: &'a Path, budget: usize) -> Self {
        Self {
            scratch,
            budget,
            current: ParameterMap::new(),
            shards: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn push(&mut self, param: Parameter) -> Result<()> {
        // Names must be unique across source files, not just within one shard.
        if !self.seen.insert(param.name().to_string()) {
            return Err(MergeError::ModelLoad(format!(
                "Duplicate parameter '{}' across source files",
                param.name()
            )));
        }

        let size = param.byte_size();
        if self.current.byte_size().saturating_add(size) > self.budget && !self.current.is_empty() {
            self.flush()?;
        }
        self.current.insert(param)
    }

    fn flush(&mut self) -> Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }

        let index = self.shards.len();
        let path = self.scratch.join(format!("part{index}.safetensors"));
        let shard = std::mem::take(&mut self.current);
        write_shard(&path, &shard).map_err(|e| e.at_stage(Stage::Split))?;
        info!("Saved {:?} ({} parameters, {} bytes)", path, shard.len(), shard.byte_size());

        self.shards.push(ShardFile {
            index,
            path,
            names: shard.names().map(str::to_string).collect(),
            bytes: shard.byte_size(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(name: &str, len: usize) -> Parameter {
        let values: Vec<f32> = (0..len).map(|i| i as f32).collect();
        Parameter::from_f32(name, vec![len], &values).unwrap()
    }

    fn write_source(dir: &Path, file: &str, params: &[Parameter]) {
        let mut map = ParameterMap::new();
        for p in params {
            map.insert(p.clone()).unwrap();
        }
        write_shard(dir.join(file), &map).unwrap();
    }

    #[test]
    fn test_split_respects_budget_and_order() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        // 16, 16, 8, 24 bytes; budget 32.
        write_source(source.path(), "model-00001.safetensors", &[param("a", 4), param("b", 4)]);
        write_source(source.path(), "model-00002.safetensors", &[param("c", 2), param("d", 6)]);

        let set = ShardSplitter::new(32)
            .split(source.path(), scratch.path().join("base"))
            .unwrap();

        let layout: Vec<Vec<String>> = set.shards().iter().map(|s| s.names().to_vec()).collect();
        assert_eq!(layout, vec![vec!["a", "b"], vec!["c", "d"]]);
        assert!(set.shards().iter().all(|s| s.bytes() <= 32));
        assert_eq!(set.num_parameters(), 4);
        assert!(set.get(1).unwrap().path().ends_with("part1.safetensors"));
    }

    #[test]
    fn test_split_concatenation_reproduces_source() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let params = vec![param("x", 3), param("y", 5), param("z", 1), param("w", 7)];
        write_source(source.path(), "model.safetensors", &params);

        let set = ShardSplitter::new(20).split(source.path(), scratch.path()).unwrap();

        let mut rebuilt = Vec::new();
        for shard in set.shards() {
            rebuilt.extend(shard.load().unwrap());
        }
        assert_eq!(rebuilt, params);
    }

    #[test]
    fn test_split_oversized_parameter_gets_own_shard() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        write_source(
            source.path(),
            "model.safetensors",
            &[param("small", 1), param("huge", 100), param("tail", 1)],
        );

        let set = ShardSplitter::new(16).split(source.path(), scratch.path()).unwrap();

        let layout: Vec<Vec<String>> = set.shards().iter().map(|s| s.names().to_vec()).collect();
        assert_eq!(layout, vec![vec!["small"], vec!["huge"], vec!["tail"]]);
        assert_eq!(set.max_shard_bytes(), 400);
    }

    #[test]
    fn test_split_is_deterministic() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let params: Vec<Parameter> = (0..10).map(|i| param(&format!("p{i}"), i + 1)).collect();
        write_source(source.path(), "model.safetensors", &params);

        let splitter = ShardSplitter::new(40);
        let first = splitter.split(source.path(), scratch.path().join("one")).unwrap();
        let second = splitter.split(source.path(), scratch.path().join("two")).unwrap();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.shards().iter().zip(second.shards()) {
            assert_eq!(a.names(), b.names());
            assert_eq!(a.bytes(), b.bytes());
            assert_eq!(a.load().unwrap(), b.load().unwrap());
        }
    }

    #[test]
    fn test_split_recreates_scratch() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        write_source(source.path(), "model.safetensors", &[param("a", 2)]);
        std::fs::write(scratch.path().join("part9.safetensors"), b"stale").unwrap();

        let set = ShardSplitter::new(1024).split(source.path(), scratch.path()).unwrap();

        assert_eq!(set.len(), 1);
        assert!(!scratch.path().join("part9.safetensors").exists());
    }

    #[test]
    fn test_split_rejects_duplicate_names_across_files() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        write_source(source.path(), "a.safetensors", &[param("w", 1)]);
        write_source(source.path(), "b.safetensors", &[param("w", 1)]);

        let err = ShardSplitter::new(1024)
            .split(source.path(), scratch.path())
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate parameter 'w'"));
    }

    #[test]
    fn test_split_empty_source_file_is_degenerate() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        write_source(source.path(), "model.safetensors", &[]);

        let err = ShardSplitter::new(1024)
            .split(source.path(), scratch.path())
            .unwrap_err();
        assert!(matches!(err, MergeError::DegenerateInput { .. }));
        assert_eq!(err.stage(), Stage::Split);
    }

    #[test]
    fn test_split_refuses_scratch_over_source_dir() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("ckpt");
        std::fs::create_dir(&source).unwrap();
        write_source(&source, "model.safetensors", &[param("a", 2)]);
        std::fs::write(source.join("config.json"), b"{}").unwrap();

        for scratch in [source.clone(), dir.path().to_path_buf()] {
            let err = ShardSplitter::new(1024).split(&source, &scratch).unwrap_err();
            assert!(matches!(err, MergeError::InvalidConfig(_)), "{err}");
        }
        assert!(source.join("model.safetensors").exists());
        assert!(source.join("config.json").exists());
    }

    #[test]
    fn test_split_refuses_scratch_over_source_file() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), "model.safetensors", &[param("a", 2)]);
        let file = dir.path().join("model.safetensors");

        for scratch in [dir.path().to_path_buf(), file.clone()] {
            let err = ShardSplitter::new(1024).split(&file, &scratch).unwrap_err();
            assert!(matches!(err, MergeError::InvalidConfig(_)), "{err}");
        }
        assert_eq!(read_shard(&file).unwrap().len(), 1);
    }

    #[test]
    fn test_scratch_inside_source_is_allowed() {
        let source = tempfile::tempdir().unwrap();
        write_source(source.path(), "model.safetensors", &[param("a", 2)]);
        let scratch = source.path().join("scratch");

        assert!(check_scratch_disjoint(source.path(), &[source.path()]).is_err());
        let set = ShardSplitter::new(1024).split(source.path(), &scratch).unwrap();
        assert_eq!(set.len(), 1);
        assert!(source.path().join("model.safetensors").exists());
    }
}
