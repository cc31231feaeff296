use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use kinetic_core::{CoordError, Result, SharedClock, codes};
use regex::Regex;

use super::{KvBackend, ServerInfo, StoreMode};

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    /// Absolute expiry in epoch milliseconds.
    expires_at: Option<i64>,
}

impl MemoryEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

/// Process-local backend with Redis TTL semantics.
///
/// Expiry is evaluated lazily against the injected clock, so tests can
/// move time forward without sleeping.
pub struct MemoryBackend {
    entries: DashMap<String, MemoryEntry>,
    clock: SharedClock,
}

impl MemoryBackend {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn live(&self, key: &str) -> Option<MemoryEntry> {
        let now = self.clock.now_millis();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry.clone())
    }

    fn expiry_from(&self, ttl_secs: u64) -> i64 {
        self.clock.now_millis() + (ttl_secs as i64).saturating_mul(1000)
    }

    fn purge_expired(&self) {
        let now = self.clock.now_millis();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }
}

/// Translate a Redis glob into an anchored regex.
///
/// Supports `*`, `?`, `[...]` classes (`^` negation, `a-z` ranges) and `\`
/// escapes. An unclosed class runs to the end of the pattern, as in Redis.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => re.push_str("(?s:.*)"),
            '?' => re.push_str("(?s:.)"),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                push_literal(&mut re, chars[i]);
            }
            '[' => {
                let end = class_end(&chars, i + 1);
                push_class(&mut re, &chars[i + 1..end]);
                i = end;
            }
            other => push_literal(&mut re, other),
        }
        i += 1;
    }
    re.push('$');
    Regex::new(&re).map_err(|e| {
        CoordError::validation(codes::INVALID_ARGUMENT, format!("bad key pattern: {e}"))
    })
}

fn push_literal(re: &mut String, ch: char) {
    re.push_str(&regex::escape(ch.encode_utf8(&mut [0; 4])));
}

/// Index of the `]` closing a class whose body starts at `start`.
fn class_end(chars: &[char], start: usize) -> usize {
    let mut j = start;
    while j < chars.len() {
        match chars[j] {
            '\\' => j += 2,
            ']' => return j,
            _ => j += 1,
        }
    }
    chars.len()
}

fn push_class(re: &mut String, body: &[char]) {
    let (negated, body) = match body.split_first() {
        Some(('^', rest)) => (true, rest),
        _ => (false, body),
    };

    let mut items = String::new();
    let mut i = 0;
    while i < body.len() {
        if body[i] == '\\' && i + 1 < body.len() {
            push_literal(&mut items, body[i + 1]);
            i += 2;
        } else if i + 2 < body.len() && body[i + 1] == '-' {
            // Redis accepts reversed ranges
            let (lo, hi) = if body[i] <= body[i + 2] {
                (body[i], body[i + 2])
            } else {
                (body[i + 2], body[i])
            };
            push_literal(&mut items, lo);
            items.push('-');
            push_literal(&mut items, hi);
            i += 3;
        } else {
            push_literal(&mut items, body[i]);
            i += 1;
        }
    }

    match (items.is_empty(), negated) {
        (true, true) => re.push_str("(?s:.)"),
        (true, false) => re.push_str("[^\\s\\S]"),
        (false, true) => {
            re.push_str("[^");
            re.push_str(&items);
            re.push(']');
        }
        (false, false) => {
            re.push('[');
            re.push_str(&items);
            re.push(']');
        }
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    fn mode(&self) -> StoreMode {
        StoreMode::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live(key).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let expires_at = ttl_secs.map(|ttl| self.expiry_from(ttl));
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        let mut removed = 0;
        for key in keys {
            if self.live(key).is_some() && self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        if self.live(key).is_none() {
            return Ok(false);
        }
        let expires_at = self.expiry_from(ttl_secs);
        Ok(match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(expires_at);
                true
            }
            None => false,
        })
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let Some(entry) = self.live(key) else {
            return Ok(-2);
        };
        Ok(match entry.expires_at {
            None => -1,
            Some(at) => {
                let remaining_ms = at - self.clock.now_millis();
                // Redis rounds the remaining time to the nearest second.
                (remaining_ms + 500) / 1000
            }
        })
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let now = self.clock.now_millis();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: "0".to_string(),
                expires_at: None,
            });
        if entry.is_expired(now) {
            *entry = MemoryEntry {
                value: "0".to_string(),
                expires_at: None,
            };
        }
        let current: i64 = entry.value.parse().map_err(|_| {
            CoordError::validation(
                codes::INVALID_ARGUMENT,
                format!("value at {key} is not an integer"),
            )
        })?;
        let next = current + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn incr_with_expire(&self, key: &str, ttl_secs: u64) -> Result<i64> {
        let count = self.incr(key).await?;
        self.expire(key, ttl_secs).await?;
        Ok(count)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = glob_to_regex(pattern)?;
        let now = self.clock.now_millis();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now) && matcher.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn info(&self) -> Result<ServerInfo> {
        self.purge_expired();
        let with_ttl = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at.is_some())
            .count();
        let mut info = ServerInfo::new();
        info.insert(
            "server".to_string(),
            BTreeMap::from([("mode".to_string(), StoreMode::Memory.to_string())]),
        );
        info.insert(
            "keyspace".to_string(),
            BTreeMap::from([
                ("keys".to_string(), self.entries.len().to_string()),
                ("expires".to_string(), with_ttl.to_string()),
            ]),
        );
        Ok(info)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
