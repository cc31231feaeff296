//! Deterministic key construction.
//!
//! Physical keys are laid out as
//!
//! ```text
//! <prefix>:<namespace>:tenant:<tenant_id>:user:<user_id>:<base_key>
//! ```
//!
//! where every segment but the prefix and base key is optional. Identical
//! logical requests always map to the same physical key, and changing any
//! scoping field maps to a different one.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Length of the hex digest appended by [`CacheKeyCodec::with_params`].
const PARAM_HASH_LEN: usize = 16;

/// Per-call key scoping and write options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyOptions {
    pub namespace: Option<String>,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    /// TTL in seconds for writes; `None` falls back to the store default
    /// and `Some(0)` disables expiry.
    pub ttl_secs: Option<u64>,
    /// Store string values verbatim instead of JSON-encoding them.
    pub raw_string: bool,
}

impl KeyOptions {
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    /// Write without expiry, ignoring the store default.
    #[must_use]
    pub fn persistent(self) -> Self {
        self.with_ttl(0)
    }

    #[must_use]
    pub fn raw(mut self) -> Self {
        self.raw_string = true;
        self
    }
}

/// Builds physical keys from a prefix and [`KeyOptions`].
#[derive(Debug, Clone)]
pub struct CacheKeyCodec {
    prefix: String,
}

impl CacheKeyCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with(':') {
            prefix.push(':');
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build the physical key for `base_key` under the given scope.
    pub fn build(&self, base_key: &str, opts: &KeyOptions) -> String {
        let mut key = String::with_capacity(self.prefix.len() + base_key.len() + 32);
        key.push_str(&self.prefix);
        if let Some(namespace) = opts.namespace.as_deref() {
            key.push_str(namespace);
            key.push(':');
        }
        if let Some(tenant_id) = opts.tenant_id.as_deref() {
            key.push_str("tenant:");
            key.push_str(tenant_id);
            key.push(':');
        }
        if let Some(user_id) = opts.user_id.as_deref() {
            key.push_str("user:");
            key.push_str(user_id);
            key.push(':');
        }
        key.push_str(base_key);
        key
    }

    /// Build a `KEYS`-style glob under the given scope.
    ///
    /// The glob characters in `pattern` are passed through untouched.
    pub fn pattern(&self, pattern: &str, opts: &KeyOptions) -> String {
        self.build(pattern, opts)
    }

    /// Strip this codec's prefix from a physical key.
    pub fn strip_prefix<'a>(&self, full_key: &'a str) -> Option<&'a str> {
        full_key.strip_prefix(self.prefix.as_str())
    }

    /// Stable short hash of a parameter object.
    ///
    /// Object keys are sorted before hashing so `{"a":1,"b":2}` and
    /// `{"b":2,"a":1}` hash identically.
    pub fn hash_params(params: &Value) -> String {
        let mut canonical = String::new();
        write_canonical(params, &mut canonical);
        let digest = Sha256::digest(canonical.as_bytes());
        let mut hashed = hex::encode(digest);
        hashed.truncate(PARAM_HASH_LEN);
        hashed
    }

    /// `base_key` suffixed with the hash of `params`.
    pub fn with_params(base_key: &str, params: &Value) -> String {
        format!("{base_key}:{}", Self::hash_params(params))
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
