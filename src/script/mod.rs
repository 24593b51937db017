//! Script evaluation bridge
//!
//! Embedded fragments such as `$${ age: { $gt: :min } }$$` are written in the
//! store's shell language. The bridge evaluates them into native values:
//!
//! - no store access and no I/O; only literals, operators, control flow and
//!   the shell constructors (`ObjectId`, `ISODate`, `NumberLong`, ...)
//! - `:name` and `?N` placeholders are bound as typed values, never spliced
//! - every evaluation is bounded by a wall-clock timeout, a nesting depth
//!   and a value size
//!
//! Runtimes are pooled. A runtime is owned by one evaluation at a time and
//! keeps an LRU cache of compiled fragments.

mod ast;
mod interp;
mod lexer;
mod parser;

use crate::native::{Document, NativeValue};
use ast::Program;
use interp::Interpreter;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Why a fragment could not be evaluated
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("syntax error at offset {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("evaluation timed out after {ms} ms")]
    Timeout { ms: u64 },

    #[error("nesting exceeds {limit} levels")]
    DepthExceeded { limit: usize },

    #[error("value exceeds the size limit of {limit}")]
    SizeExceeded { limit: usize },

    #[error("no value bound for placeholder {0}")]
    UnboundParameter(String),

    #[error("{0}")]
    Reference(String),

    #[error("{0}")]
    Type(String),

    #[error("{0} are not supported in fragments")]
    Unsupported(String),
}

/// A failed fragment evaluation
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Failed to evaluate fragment `{fragment}`: {cause}")]
pub struct ScriptEvaluationError {
    pub fragment: String,
    pub cause: ScriptError,
}

impl ScriptEvaluationError {
    pub fn new(fragment: &str, cause: ScriptError) -> Self {
        Self {
            fragment: fragment.trim().to_string(),
            cause,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, ScriptError::Timeout { .. })
    }
}

/// Script limits and pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Wall-clock budget per evaluation
    pub timeout_ms: u64,
    /// Maximum number of runtimes alive at once
    pub pool_size: usize,
    /// Maximum syntax and value nesting
    pub max_depth: usize,
    /// Maximum total size of a value (string bytes plus elements)
    pub max_value_len: usize,
    /// Compiled fragments kept per runtime
    pub cache_size: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            pool_size: 4,
            max_depth: 100,
            max_value_len: 16 * 1024 * 1024,
            cache_size: 128,
        }
    }
}

impl ScriptConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Typed values for placeholders inside fragments
#[derive(Debug, Clone, Default)]
pub struct BindingContext {
    /// `?1`, `?2`, ... in order
    pub positional: Vec<NativeValue>,
    /// `:name`
    pub named: HashMap<String, NativeValue>,
}

impl BindingContext {
    pub fn new(positional: Vec<NativeValue>, named: HashMap<String, NativeValue>) -> Self {
        Self { positional, named }
    }
}

// ============================================================================
// Runtimes
// ============================================================================

/// One interpreter instance with its compiled-fragment cache
pub struct ScriptRuntime {
    config: ScriptConfig,
    cache: LruCache<String, Arc<Program>>,
}

impl ScriptRuntime {
    pub fn new(config: ScriptConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            cache: LruCache::new(capacity),
        }
    }

    fn compile(&mut self, fragment: &str) -> Result<Arc<Program>, ScriptError> {
        if let Some(program) = self.cache.get(fragment) {
            return Ok(Arc::clone(program));
        }
        let program = Arc::new(parser::parse_program(fragment, self.config.max_depth)?);
        self.cache.put(fragment.to_string(), Arc::clone(&program));
        Ok(program)
    }

    /// Evaluate a fragment; the value of its last expression statement is the result
    pub fn evaluate(
        &mut self,
        fragment: &str,
        bindings: &BindingContext,
    ) -> Result<NativeValue, ScriptError> {
        let started = Instant::now();
        let program = self.compile(fragment)?;
        Interpreter::new(bindings, &self.config, started).run(&program)
    }

    pub fn cached_fragments(&self) -> usize {
        self.cache.len()
    }
}

struct PoolState {
    idle: Vec<ScriptRuntime>,
    created: usize,
}

/// Hands out single-owner runtimes, creating up to `pool_size` lazily
pub struct RuntimePool {
    config: ScriptConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl RuntimePool {
    pub fn new(config: ScriptConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState { idle: Vec::new(), created: 0 }),
            available: Condvar::new(),
        }
    }

    /// Take a runtime, waiting up to the script timeout for one to free up
    pub fn acquire(&self) -> Result<PooledRuntime<'_>, ScriptError> {
        let deadline = Instant::now() + self.config.timeout();
        let mut state = self.state.lock();
        loop {
            if let Some(runtime) = state.idle.pop() {
                return Ok(PooledRuntime { pool: self, runtime: Some(runtime) });
            }
            if state.created < self.config.pool_size.max(1) {
                state.created += 1;
                debug!(created = state.created, "Starting script runtime");
                let runtime = ScriptRuntime::new(self.config.clone());
                return Ok(PooledRuntime { pool: self, runtime: Some(runtime) });
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return Err(ScriptError::Timeout { ms: self.config.timeout_ms });
            }
        }
    }

    fn release(&self, runtime: ScriptRuntime) {
        self.state.lock().idle.push(runtime);
        self.available.notify_one();
    }

    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }
}

/// A runtime on loan from the pool; returned on drop
pub struct PooledRuntime<'a> {
    pool: &'a RuntimePool,
    /// Only emptied by `drop`
    runtime: Option<ScriptRuntime>,
}

impl Deref for PooledRuntime<'_> {
    type Target = ScriptRuntime;

    fn deref(&self) -> &ScriptRuntime {
        match &self.runtime {
            Some(runtime) => runtime,
            None => unreachable!("pooled runtime used after release"),
        }
    }
}

impl DerefMut for PooledRuntime<'_> {
    fn deref_mut(&mut self) -> &mut ScriptRuntime {
        match &mut self.runtime {
            Some(runtime) => runtime,
            None => unreachable!("pooled runtime used after release"),
        }
    }
}

impl Drop for PooledRuntime<'_> {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.pool.release(runtime);
        }
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// Evaluates fragments on pooled runtimes
pub struct ScriptBridge {
    pool: RuntimePool,
}

impl ScriptBridge {
    pub fn new(config: ScriptConfig) -> Self {
        Self { pool: RuntimePool::new(config) }
    }

    pub fn evaluate(
        &self,
        fragment: &str,
        bindings: &BindingContext,
    ) -> Result<NativeValue, ScriptEvaluationError> {
        let mut runtime = self
            .pool
            .acquire()
            .map_err(|cause| ScriptEvaluationError::new(fragment, cause))?;
        let value = runtime
            .evaluate(fragment, bindings)
            .map_err(|cause| ScriptEvaluationError::new(fragment, cause))?;
        debug!(kind = %value.kind(), "Evaluated fragment");
        Ok(value)
    }

    /// Evaluate a fragment that must produce a document
    pub fn evaluate_document(
        &self,
        fragment: &str,
        bindings: &BindingContext,
    ) -> Result<Document, ScriptEvaluationError> {
        match self.evaluate(fragment, bindings)? {
            NativeValue::Document(doc) => Ok(doc),
            other => Err(ScriptEvaluationError::new(
                fragment,
                ScriptError::Type(format!("fragment must evaluate to a document, got {}", other.kind())),
            )),
        }
    }

    pub fn pool(&self) -> &RuntimePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_bridge_evaluates_filter() {
        let bridge = ScriptBridge::new(ScriptConfig::default());
        let mut bindings = BindingContext::default();
        bindings.named.insert("min".into(), NativeValue::Int32(30));

        let doc = bridge
            .evaluate_document("{ age: { $gte: :min } }", &bindings)
            .unwrap();
        assert_eq!(doc.get_path("age.$gte"), Some(&NativeValue::Int32(30)));
    }

    #[test]
    fn test_bridge_timeout() {
        let bridge = ScriptBridge::new(ScriptConfig { timeout_ms: 20, ..ScriptConfig::default() });
        let err = bridge
            .evaluate("for (;;) { }", &BindingContext::default())
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.fragment, "for (;;) { }");
    }

    #[test]
    fn test_non_document_rejected() {
        let bridge = ScriptBridge::new(ScriptConfig::default());
        let err = bridge
            .evaluate_document("[1, 2]", &BindingContext::default())
            .unwrap_err();
        assert!(matches!(err.cause, ScriptError::Type(_)));
    }

    #[test]
    fn test_runtime_caches_compiled_fragments() {
        let mut runtime = ScriptRuntime::new(ScriptConfig::default());
        let bindings = BindingContext::default();
        runtime.evaluate("1 + 1", &bindings).unwrap();
        runtime.evaluate("1 + 1", &bindings).unwrap();
        runtime.evaluate("2 + 2", &bindings).unwrap();
        assert_eq!(runtime.cached_fragments(), 2);
    }

    #[test]
    fn test_pool_reuses_runtimes() {
        let pool = RuntimePool::new(ScriptConfig { pool_size: 1, ..ScriptConfig::default() });
        {
            let mut runtime = pool.acquire().unwrap();
            runtime.evaluate("1", &BindingContext::default()).unwrap();
        }
        assert_eq!(pool.idle(), 1);

        let runtime = pool.acquire().unwrap();
        assert_eq!(runtime.cached_fragments(), 1);
    }

    #[test]
    fn test_released_runtime_keeps_its_cache() {
        let pool = RuntimePool::new(ScriptConfig { pool_size: 1, ..ScriptConfig::default() });
        for (i, fragment) in ["1", "2", "3"].into_iter().enumerate() {
            let mut runtime = pool.acquire().unwrap();
            assert_eq!(runtime.cached_fragments(), i);
            runtime.evaluate(fragment, &BindingContext::default()).unwrap();
        }
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.acquire().unwrap().cached_fragments(), 3);
    }

    #[test]
    fn test_pool_waits_then_times_out() {
        let pool = RuntimePool::new(ScriptConfig {
            pool_size: 1,
            timeout_ms: 20,
            ..ScriptConfig::default()
        });
        let held = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(ScriptError::Timeout { ms: 20 })));
        drop(held);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_concurrent_evaluation() {
        let bridge = Arc::new(ScriptBridge::new(ScriptConfig { pool_size: 2, ..ScriptConfig::default() }));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let bridge = Arc::clone(&bridge);
                thread::spawn(move || {
                    let bindings = BindingContext::new(vec![NativeValue::Int32(i)], HashMap::new());
                    bridge.evaluate("?1 * 2", &bindings).unwrap()
                })
            })
            .collect();
        let mut results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().as_i64().unwrap())
            .collect();
        results.sort_unstable();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14]);
        assert!(bridge.pool().idle() <= 2);
    }
}
