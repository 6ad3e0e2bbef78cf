//! Single-shard-resident name lookup across a [`ShardSet`].

use tracing::debug;

use crate::{MergeError, Parameter, ParameterMap, Result, ShardSet, Stage};

/// Lookup counters for one resolver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    /// Total lookups.
    pub lookups: usize,
    /// Lookups answered by the resident shard.
    pub hits: usize,
    /// Shards loaded from disk.
    pub shard_loads: usize,
}

struct CachedShard {
    index: usize,
    params: ParameterMap,
}

/// Resolves parameter names against a shard set while keeping at most one
/// shard in memory.
///
/// A miss scans the shards after the resident one in ascending order, then
/// wraps around to the ones before it, loading each in turn. The resident
/// shard is dropped before the next one is read.
pub struct ShardResolver<'a> {
    set: &'a ShardSet,
    cached: Option<CachedShard>,
    stats: ResolverStats,
}

impl<'a> ShardResolver<'a> {
    /// Create a resolver with an empty cache.
    pub fn new(set: &'a ShardSet) -> Self {
        Self {
            set,
            cached: None,
            stats: ResolverStats::default(),
        }
    }

    /// Eagerly load the first shard.
    pub fn prime(&mut self) -> Result<()> {
        if self.set.is_empty() {
            return Ok(());
        }
        self.load(0)
    }

    /// Index of the resident shard.
    pub fn cached_index(&self) -> Option<usize> {
        self.cached.as_ref().map(|c| c.index)
    }

    /// Lookup counters so far.
    pub fn stats(&self) -> ResolverStats {
        self.stats
    }

    /// Return the parameter called `name`, loading shards as needed.
    pub fn resolve(&mut self, name: &str) -> Result<&Parameter> {
        self.stats.lookups += 1;

        let resident = self.cached_index();
        let hit = self.cached.as_ref().is_some_and(|c| c.params.contains(name));

        if hit {
            self.stats.hits += 1;
        } else {
            let count = self.set.len();
            let start = resident.map_or(0, |i| i + 1);
            let mut found = false;

            for idx in (0..count).map(|k| (start + k) % count) {
                if Some(idx) == resident {
                    continue;
                }
                self.load(idx)?;
                if self.cached.as_ref().is_some_and(|c| c.params.contains(name)) {
                    found = true;
                    break;
                }
            }

            if !found {
                return Err(MergeError::ShardNotFound {
                    name: name.to_string(),
                    shards: count,
                });
            }
        }

        self.cached
            .as_ref()
            .and_then(|c| c.params.get(name))
            .ok_or_else(|| MergeError::ShardNotFound {
                name: name.to_string(),
                shards: self.set.len(),
            })
    }

    fn load(&mut self, index: usize) -> Result<()> {
        let shard = self.set.get(index).ok_or_else(|| {
            MergeError::InvalidConfig(format!("Shard index {index} out of range"))
        })?;

        // Release the resident shard before reading the next one.
        self.cached = None;

        debug!("Loading delta shard {} from {:?}", index, shard.path());
        let params = shard.load().map_err(|e| e.at_stage(Stage::Resolve))?;
        self.stats.shard_loads += 1;
        self.cached = Some(CachedShard { index, params });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::write_shard;
    use crate::ShardSplitter;

    fn split(values: &[(&str, usize)], budget: u64) -> (tempfile::TempDir, ShardSet) {
        let dir = tempfile::tempdir().unwrap();
        let mut map = ParameterMap::new();
        for (name, len) in values {
            map.insert(Parameter::from_f32(*name, vec![*len], &vec![1.0; *len]).unwrap())
                .unwrap();
        }
        std::fs::create_dir(dir.path().join("src")).unwrap();
        write_shard(dir.path().join("src/model.safetensors"), &map).unwrap();
        let set = ShardSplitter::new(budget)
            .split(dir.path().join("src"), dir.path().join("scratch"))
            .unwrap();
        (dir, set)
    }

    #[test]
    fn test_resolve_reuses_resident_shard() {
        // Each shard holds two 8-byte parameters.
        let (_dir, set) = split(&[("a", 2), ("b", 2), ("c", 2), ("d", 2)], 16);
        assert_eq!(set.len(), 2);

        let mut resolver = ShardResolver::new(&set);
        resolver.prime().unwrap();
        for name in ["a", "b", "c", "d"] {
            assert_eq!(resolver.resolve(name).unwrap().name(), name);
        }

        let stats = resolver.stats();
        assert_eq!(stats.lookups, 4);
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.shard_loads, 2);
        assert_eq!(resolver.cached_index(), Some(1));
    }

    #[test]
    fn test_resolve_wraps_to_earlier_shards() {
        let (_dir, set) = split(&[("a", 2), ("b", 2), ("c", 2)], 8);
        assert_eq!(set.len(), 3);

        let mut resolver = ShardResolver::new(&set);
        resolver.prime().unwrap();
        resolver.resolve("c").unwrap();
        assert_eq!(resolver.cached_index(), Some(2));

        resolver.resolve("a").unwrap();
        assert_eq!(resolver.cached_index(), Some(0));
    }

    #[test]
    fn test_resolve_without_prime() {
        let (_dir, set) = split(&[("a", 2), ("b", 2)], 8);
        let mut resolver = ShardResolver::new(&set);
        assert_eq!(resolver.resolve("b").unwrap().shape(), &[2]);
        assert_eq!(resolver.stats().shard_loads, 2);
    }

    #[test]
    fn test_resolve_missing_name() {
        let (_dir, set) = split(&[("a", 2), ("b", 2)], 8);
        let mut resolver = ShardResolver::new(&set);
        resolver.prime().unwrap();

        let err = resolver.resolve("missing").unwrap_err();
        assert!(matches!(
            err,
            MergeError::ShardNotFound { ref name, shards: 2 } if name == "missing"
        ));
        assert_eq!(err.stage(), Stage::Resolve);
    }
}
