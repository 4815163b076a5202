//! Process-wide compiled-regex cache (spec §5, §9): patterns are compiled on
//! first use and kept for the life of the process, guarded by a single mutex
//! rather than one lock per entry.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;

static CACHE: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid regex pattern: {0}")]
pub struct RegexCompileError(pub String);

/// Return a cached compiled [`Regex`] for `pattern`, compiling and inserting
/// it on first use. An empty pattern is rejected (spec §4.4).
pub fn get(pattern: &str) -> Result<Regex, RegexCompileError> {
    if pattern.is_empty() {
        return Err(RegexCompileError("empty pattern".to_string()));
    }
    {
        let cache = CACHE.lock().expect("regex cache mutex poisoned");
        if let Some(re) = cache.get(pattern) {
            return Ok(re.clone());
        }
    }
    let compiled = Regex::new(pattern).map_err(|e| RegexCompileError(e.to_string()))?;
    let mut cache = CACHE.lock().expect("regex cache mutex poisoned");
    cache.insert(pattern.to_string(), compiled.clone());
    Ok(compiled)
}
