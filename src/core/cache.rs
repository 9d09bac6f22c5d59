//! Compiled program cache keyed by the SHA-256 of the script source.
//!
//! Entries are evicted least recently used first once the summed cost exceeds the byte
//! budget. A program whose cost alone exceeds the budget is never admitted, so a `set`
//! may fail and callers treat a miss as "compile again".

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;

use crate::machine::program::{CompileError, Compiler, Program};
use crate::utils::digest_source;

type Key = [u8; 32];

struct Entry {
    program: Arc<Program>,
    cost: u64,
}

struct CacheState {
    entries: LruCache<Key, Entry>,
    cost: u64,
}

pub struct ProgramCache {
    max_cost: u64,
    state: Mutex<CacheState>,
}

impl ProgramCache {
    pub fn new(max_cost: u64) -> Self {
        Self {
            max_cost,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                cost: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // Every mutation leaves the state consistent, a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, source: &str) -> Option<Arc<Program>> {
        let key = digest_source(source);
        self.lock().entries.get(&key).map(|entry| Arc::clone(&entry.program))
    }

    /// Admits `program`, evicting older entries as needed. Returns whether it was stored.
    pub fn set(&self, source: &str, program: Arc<Program>) -> bool {
        let key = digest_source(source);
        let cost = key.len() as u64 + program.estimated_size();
        if cost > self.max_cost {
            return false;
        }

        let mut state = self.lock();
        if let Some(previous) = state.entries.pop(&key) {
            state.cost -= previous.cost;
        }
        while state.cost + cost > self.max_cost {
            match state.entries.pop_lru() {
                Some((_, evicted)) => state.cost -= evicted.cost,
                None => break,
            }
        }
        state.entries.put(key, Entry { program, cost });
        state.cost += cost;
        true
    }

    /// Cached program for `source`, compiling and caching it on a miss.
    pub fn get_or_compile(&self, source: &str, compiler: &dyn Compiler) -> Result<Arc<Program>, CompileError> {
        if let Some(program) = self.get(source) {
            tracing::debug!("program found in cache");
            return Ok(program);
        }
        let program = Arc::new(compiler.compile(source)?);
        let admitted = self.set(source, Arc::clone(&program));
        tracing::debug!(size = program.estimated_size(), admitted, "program not found in cache");
        Ok(program)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summed cost of the cached entries.
    pub fn cost(&self) -> u64 {
        self.lock().cost
    }

    pub fn max_cost(&self) -> u64 {
        self.max_cost
    }
}

impl fmt::Debug for ProgramCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramCache")
            .field("entries", &self.len())
            .field("cost", &self.cost())
            .field("max_cost", &self.max_cost)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::asset::Asset;
    use crate::machine::program::{JsonCompiler, ProgramBuilder};
    use crate::machine::value::Monetary;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn program(amount: u64) -> Program {
        let mut builder = ProgramBuilder::new();
        builder.send("world", "users:001", Monetary::new(Asset::parse("USD").unwrap(), amount));
        builder.build()
    }

    fn source(amount: u64) -> String {
        serde_json::to_string(&program(amount)).unwrap()
    }

    struct CountingCompiler(AtomicUsize);

    impl Compiler for CountingCompiler {
        fn compile(&self, source: &str) -> Result<Program, CompileError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            JsonCompiler.compile(source)
        }
    }

    #[test]
    fn test_get_or_compile_compiles_once() {
        let cache = ProgramCache::new(1024 * 1024);
        let compiler = CountingCompiler(AtomicUsize::new(0));
        let src = source(10);

        let first = cache.get_or_compile(&src, &compiler).unwrap();
        let second = cache.get_or_compile(&src, &compiler).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(compiler.0.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_oversized_program_is_rejected() {
        let cache = ProgramCache::new(8);
        assert!(!cache.set("src", Arc::new(program(1))));
        assert!(cache.get("src").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_least_recently_used_entry_is_evicted() {
        let one = Arc::new(program(1));
        let cost = 32 + one.estimated_size();
        let cache = ProgramCache::new(cost * 2);

        assert!(cache.set("a", Arc::clone(&one)));
        assert!(cache.set("b", Arc::new(program(2))));
        assert!(cache.get("a").is_some());
        assert!(cache.set("c", Arc::new(program(3))));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert!(cache.cost() <= cache.max_cost());
    }

    #[test]
    fn test_compile_error_is_not_cached() {
        let cache = ProgramCache::new(1024);
        assert!(cache.get_or_compile("not a program", &JsonCompiler).is_err());
        assert!(cache.is_empty());
    }
}
