use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::dict::meta::{self, DictMeta, DEFAULT_NS};
use crate::dict::pool::DictPool;
use crate::error::Result;
use crate::stats::{NsStats, StatsRegistry};

/// Sentinel for an empty slot in the id index.
const NO_META: u32 = u32::MAX;

/// One namespace: a key prefix and its dictionaries, newest first. The
/// head is the active dictionary for new writes; older entries stay
/// resident so previously written values keep decompressing.
pub struct NamespaceEntry {
    pub prefix: String,
    pub dicts: Vec<Arc<DictMeta>>,
    /// Counter block for this namespace, shared across generations.
    pub stats: Arc<NsStats>,
}

impl NamespaceEntry {
    /// The active dictionary for new writes.
    pub fn active(&self) -> &Arc<DictMeta> {
        &self.dicts[0]
    }

    pub fn is_default(&self) -> bool {
        self.prefix == DEFAULT_NS
    }
}

/// An immutable routing snapshot: prefix routing plus an O(1) id index.
///
/// Built by one publisher, installed once into the engine's shared
/// pointer, then never mutated. Readers hold it only for the duration
/// of one operation.
pub struct RoutingTable {
    pub spaces: Vec<NamespaceEntry>,
    /// Contiguous ownership of every resident dictionary.
    pub metas: Vec<Arc<DictMeta>>,
    /// 65,536-slot direct index: dict id -> position in `metas`.
    by_id: Vec<u32>,
    /// Build time, epoch seconds.
    pub built_at: i64,
    /// Generation number, stamped by the publisher.
    pub gen: u64,
}

impl RoutingTable {
    /// A table with no dictionaries; routing falls through to dict-less
    /// compression.
    pub fn empty(built_at: i64) -> Self {
        Self {
            spaces: Vec::new(),
            metas: Vec::new(),
            by_id: vec![NO_META; 1 << 16],
            built_at,
            gen: 0,
        }
    }

    /// Build a table from the dictionary directory.
    ///
    /// Regular files named `<numeric id>.dict` are considered; anything
    /// else is ignored. Each dictionary's manifest is parsed, its
    /// compiled handles are retained through the pool, and the result
    /// is grouped per prefix, newest first, truncated to `max_per_ns`.
    /// Dictionaries whose retirement has outlived the quarantine are
    /// left for the reclaimer to unlink.
    pub fn scan_dict_dir(
        dir: &Path,
        max_per_ns: usize,
        quarantine_s: i64,
        level: i32,
        pool: &DictPool,
        stats: &StatsRegistry,
        now: i64,
    ) -> Result<Self> {
        let mut metas = Vec::new();
        for mut parsed in meta::scan_manifests(dir)? {
            if parsed.is_retired() && now - parsed.retired >= quarantine_s {
                continue;
            }
            let compile_level = if parsed.level != 0 { parsed.level } else { level };
            match pool.retain_for_meta(&parsed, compile_level) {
                Ok(compiled) => {
                    parsed.compiled = Some(compiled);
                    metas.push(Arc::new(parsed));
                }
                Err(e) => {
                    tracing::warn!(id = parsed.id, error = %e, "Skipping uncompilable dictionary");
                }
            }
        }

        // Newest wins on an id clash; clashes should not happen, but a
        // half-cleaned directory must not poison routing.
        metas.sort_by_key(|m| (m.created, m.id));
        let mut by_id = vec![NO_META; 1 << 16];
        for (index, meta) in metas.iter().enumerate() {
            by_id[meta.id as usize] = index as u32;
        }

        let mut groups: HashMap<&str, Vec<&Arc<DictMeta>>> = HashMap::new();
        for meta in &metas {
            for prefix in &meta.prefixes {
                groups.entry(prefix.as_str()).or_default().push(meta);
            }
        }

        let mut spaces = Vec::with_capacity(groups.len());
        for (prefix, mut dicts) in groups {
            dicts.sort_by(|a, b| (b.created, b.id).cmp(&(a.created, a.id)));
            dicts.truncate(max_per_ns);
            spaces.push(NamespaceEntry {
                prefix: prefix.to_string(),
                dicts: dicts.into_iter().map(Arc::clone).collect(),
                stats: stats.for_namespace(prefix),
            });
        }
        spaces.sort_by(|a, b| a.prefix.cmp(&b.prefix));

        Ok(Self {
            spaces,
            metas,
            by_id,
            built_at: now,
            gen: 0,
        })
    }

    /// Longest-prefix namespace match for a key. "default" is synthetic
    /// and never prefix-matched; it is the fallback when nothing else
    /// matches.
    pub fn pick_namespace(&self, key: &[u8]) -> Option<&NamespaceEntry> {
        let mut best: Option<&NamespaceEntry> = None;
        let mut best_len = 0;
        let mut default = None;
        for entry in &self.spaces {
            if entry.is_default() {
                default = Some(entry);
                continue;
            }
            let prefix = entry.prefix.as_bytes();
            if prefix.len() <= key.len()
                && prefix.len() > best_len
                && key.starts_with(prefix)
            {
                best_len = prefix.len();
                best = Some(entry);
            }
        }
        best.or(default)
    }

    /// Active dictionary for a key, following the namespace routing.
    pub fn pick_dict(&self, key: &[u8]) -> Option<&Arc<DictMeta>> {
        self.pick_namespace(key).map(NamespaceEntry::active)
    }

    /// O(1) lookup by dictionary id.
    pub fn lookup_by_id(&self, id: u16) -> Option<&Arc<DictMeta>> {
        match self.by_id[id as usize] {
            NO_META => None,
            index => Some(&self.metas[index as usize]),
        }
    }

    /// True when a "default" namespace with at least one dictionary is
    /// present; its absence drives trainer bootstrap.
    pub fn has_default_dict(&self) -> bool {
        self.spaces
            .iter()
            .any(|entry| entry.is_default() && !entry.dicts.is_empty())
    }

    pub fn namespace_names(&self) -> Vec<String> {
        self.spaces.iter().map(|e| e.prefix.clone()).collect()
    }

    /// Ids of every resident dictionary; the reclaimer treats files
    /// outside this set as candidates for unlinking.
    pub fn resident_ids(&self) -> Vec<u16> {
        self.metas.iter().map(|m| m.id).collect()
    }

    /// Release every meta's pool retain. Called exactly once per table,
    /// by the reclaimer (or at shutdown).
    pub fn release_dicts(&self, pool: &DictPool) {
        for meta in &self.metas {
            pool.release_for_meta(meta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::meta::save_dictionary;
    use crate::tmpfs::TempDir;

    fn scan(dir: &TempDir, pool: &DictPool, stats: &StatsRegistry, now: i64) -> RoutingTable {
        RoutingTable::scan_dict_dir(dir.path(), 10, 3600, 3, pool, stats, now).unwrap()
    }

    fn prefixes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_prefix_routing() {
        let dir = TempDir::new().unwrap();
        let pool = DictPool::new();
        let stats = StatsRegistry::new();

        // id 1..4 occupied so the interesting ids land at 5 and 7.
        for created in [10, 11, 12, 13] {
            save_dictionary(dir.path(), &vec![0u8; 1100], &[], 3, created, 0).unwrap();
        }
        let user = save_dictionary(dir.path(), &vec![1u8; 1100], &prefixes(&["user:"]), 3, 20, 0)
            .unwrap();
        save_dictionary(dir.path(), &vec![2u8; 1100], &prefixes(&["acct:"]), 3, 21, 0).unwrap();
        let log = save_dictionary(dir.path(), &vec![3u8; 1100], &prefixes(&["log:"]), 3, 22, 0)
            .unwrap();
        assert_eq!((user.id, log.id), (5, 7));

        let table = scan(&dir, &pool, &stats, 100);
        assert_eq!(table.pick_dict(b"user:42").unwrap().id, 5);
        assert_eq!(table.pick_dict(b"log:abc").unwrap().id, 7);
        // "logbook" does not carry the colon, so it falls to default.
        let fallback = table.pick_dict(b"logbook").unwrap();
        assert!(fallback.routes_default());
        // Default head is the newest default-routed dictionary (id 4).
        assert_eq!(fallback.id, 4);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let dir = TempDir::new().unwrap();
        let pool = DictPool::new();
        let stats = StatsRegistry::new();
        let short = save_dictionary(dir.path(), &vec![1u8; 1100], &prefixes(&["a:"]), 3, 10, 0)
            .unwrap();
        let long = save_dictionary(dir.path(), &vec![2u8; 1100], &prefixes(&["a:b:"]), 3, 11, 0)
            .unwrap();

        let table = scan(&dir, &pool, &stats, 100);
        assert_eq!(table.pick_dict(b"a:b:key").unwrap().id, long.id);
        assert_eq!(table.pick_dict(b"a:key").unwrap().id, short.id);
        assert!(table.pick_dict(b"other").is_none(), "no default present");
    }

    #[test]
    fn test_newest_first_and_retain_cap() {
        let dir = TempDir::new().unwrap();
        let pool = DictPool::new();
        let stats = StatsRegistry::new();
        for created in 1..=5 {
            save_dictionary(dir.path(), &vec![created as u8; 1100], &[], 3, created, 0).unwrap();
        }

        let table =
            RoutingTable::scan_dict_dir(dir.path(), 3, 3600, 3, &pool, &stats, 100).unwrap();
        let entry = table.pick_namespace(b"anything").unwrap();
        assert_eq!(entry.prefix, DEFAULT_NS);
        assert_eq!(entry.dicts.len(), 3, "capped at max_per_ns");
        let created: Vec<i64> = entry.dicts.iter().map(|d| d.created).collect();
        assert_eq!(created, vec![5, 4, 3], "newest first");

        // Truncated dictionaries stay resident for id lookups.
        assert_eq!(table.metas.len(), 5);
        assert!(table.lookup_by_id(1).is_some());
    }

    #[test]
    fn test_id_index_is_same_object() {
        let dir = TempDir::new().unwrap();
        let pool = DictPool::new();
        let stats = StatsRegistry::new();
        let saved = save_dictionary(dir.path(), &vec![7u8; 1100], &[], 3, 10, 0).unwrap();

        let table = scan(&dir, &pool, &stats, 100);
        let by_id = table.lookup_by_id(saved.id).unwrap();
        let by_key = table.pick_dict(b"whatever").unwrap();
        assert!(Arc::ptr_eq(by_id, by_key));
        assert!(table.lookup_by_id(999).is_none());
    }

    #[test]
    fn test_multi_prefix_dict_is_shared() {
        let dir = TempDir::new().unwrap();
        let pool = DictPool::new();
        let stats = StatsRegistry::new();
        save_dictionary(
            dir.path(),
            &vec![4u8; 1100],
            &prefixes(&["user:", "sess:"]),
            3,
            10,
            0,
        )
        .unwrap();

        let table = scan(&dir, &pool, &stats, 100);
        let a = table.pick_dict(b"user:1").unwrap();
        let b = table.pick_dict(b"sess:1").unwrap();
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(table.metas.len(), 1);
        // One retain per meta, not per namespace.
        assert_eq!(pool.refcount_for_meta(a), 1);
    }

    #[test]
    fn test_quarantine_expired_dicts_are_skipped() {
        let dir = TempDir::new().unwrap();
        let pool = DictPool::new();
        let stats = StatsRegistry::new();
        let old = save_dictionary(dir.path(), &vec![1u8; 1100], &[], 3, 10, 0).unwrap();
        crate::dict::meta::retire_dictionary(dir.path(), &old, 20).unwrap();
        save_dictionary(dir.path(), &vec![2u8; 1100], &[], 3, 30, 3600).unwrap();

        // Within quarantine the retired dict stays resident.
        let table = RoutingTable::scan_dict_dir(dir.path(), 10, 100, 3, &pool, &stats, 50).unwrap();
        assert_eq!(table.metas.len(), 2);

        // Once quarantine elapses it is dropped from the table.
        let table =
            RoutingTable::scan_dict_dir(dir.path(), 10, 100, 3, &pool, &stats, 500).unwrap();
        assert_eq!(table.metas.len(), 1);
        assert!(table.lookup_by_id(old.id).is_none());
    }

    #[test]
    fn test_has_default_dict() {
        let dir = TempDir::new().unwrap();
        let pool = DictPool::new();
        let stats = StatsRegistry::new();

        let empty = scan(&dir, &pool, &stats, 100);
        assert!(!empty.has_default_dict());

        save_dictionary(dir.path(), &vec![1u8; 1100], &prefixes(&["user:"]), 3, 10, 0).unwrap();
        let no_default = scan(&dir, &pool, &stats, 100);
        assert!(!no_default.has_default_dict());

        save_dictionary(dir.path(), &vec![2u8; 1100], &[], 3, 11, 0).unwrap();
        let with_default = scan(&dir, &pool, &stats, 100);
        assert!(with_default.has_default_dict());
    }

    #[test]
    fn test_release_dicts_returns_pool_retains() {
        let dir = TempDir::new().unwrap();
        let pool = DictPool::new();
        let stats = StatsRegistry::new();
        save_dictionary(dir.path(), &vec![1u8; 1100], &[], 3, 10, 0).unwrap();

        let t1 = scan(&dir, &pool, &stats, 100);
        let t2 = scan(&dir, &pool, &stats, 101);
        let meta = t1.pick_dict(b"k").unwrap();
        assert_eq!(pool.refcount_for_meta(meta), 2);

        t1.release_dicts(&pool);
        assert_eq!(pool.refcount_for_meta(t2.pick_dict(b"k").unwrap()), 1);
        t2.release_dicts(&pool);
        assert!(pool.is_empty());
    }
}
