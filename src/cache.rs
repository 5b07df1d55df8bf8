use crate::parse::{parse_template, CompileOptions};
use crate::validate::{CompilerError, ParsedTemplate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: String,
    pub template: ParsedTemplate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
}

/// Parsed templates keyed by the hash of their source and options.
pub struct ParseCache {
    memory: Mutex<HashMap<String, ParsedTemplate>>,
    cache_dir: Option<PathBuf>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl ParseCache {
    pub fn in_memory() -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            cache_dir: None,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Memory cache backed by JSON files in `cache_dir`.
    pub fn with_dir(cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir).ok();
        }
        Self {
            cache_dir: Some(cache_dir),
            ..Self::in_memory()
        }
    }

    pub fn for_options(options: &CompileOptions) -> Self {
        match &options.cache_dir {
            Some(dir) => Self::with_dir(dir.clone()),
            None => Self::in_memory(),
        }
    }

    pub fn compute_hash(template: &str, options: &CompileOptions) -> String {
        let keyed = CompileOptions {
            cache_dir: None,
            ..options.clone()
        };
        let mut hasher = Sha256::new();
        hasher.update(template.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(&keyed).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }

    fn get_cache_path(&self, hash: &str) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", hash)))
    }

    fn read_disk(&self, hash: &str) -> Option<ParsedTemplate> {
        let cache_path = self.get_cache_path(hash)?;
        let data = fs::read_to_string(&cache_path).ok()?;

        match serde_json::from_str::<CacheEntry>(&data) {
            Ok(entry) if entry.hash == hash => Some(entry.template),
            Ok(_) => None,
            Err(e) => {
                warn!(path = %cache_path.display(), error = %e, "discarding corrupt parse cache entry");
                fs::remove_file(cache_path).ok();
                None
            }
        }
    }

    pub fn get(&self, template: &str, options: &CompileOptions) -> Option<ParsedTemplate> {
        let hash = Self::compute_hash(template, options);

        let cached = self
            .memory
            .lock()
            .ok()
            .and_then(|memory| memory.get(&hash).cloned());
        let found = cached.or_else(|| {
            let from_disk = self.read_disk(&hash)?;
            if let Ok(mut memory) = self.memory.lock() {
                memory.insert(hash.clone(), from_disk.clone());
            }
            Some(from_disk)
        });

        match &found {
            Some(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(selector = %options.selector, "parse cache hit");
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(selector = %options.selector, "parse cache miss");
            }
        }
        found
    }

    pub fn set(&self, template: &str, options: &CompileOptions, parsed: &ParsedTemplate) {
        let hash = Self::compute_hash(template, options);

        if let Some(cache_path) = self.get_cache_path(&hash) {
            let entry = CacheEntry {
                hash: hash.clone(),
                template: parsed.clone(),
            };
            if let Ok(data) = serde_json::to_string(&entry) {
                fs::write(cache_path, data).ok();
            }
        }
        if let Ok(mut memory) = self.memory.lock() {
            memory.insert(hash, parsed.clone());
        }
    }

    /// Parse through the cache. Failed parses are not cached.
    pub fn get_or_parse(
        &self,
        template: &str,
        options: &CompileOptions,
    ) -> Result<ParsedTemplate, CompilerError> {
        if let Some(parsed) = self.get(template, options) {
            return Ok(parsed);
        }
        let parsed = parse_template(template, options)?;
        self.set(template, options, &parsed);
        Ok(parsed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
