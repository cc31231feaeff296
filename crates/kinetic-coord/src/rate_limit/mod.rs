//! Fixed-window request rate limiting.
//!
//! Counters are keyed `<identity>:<window>` where
//! `window = floor(now / window_ms)`. A counter is created on the first hit
//! of a window and left to expire; it is never deleted explicitly. Requests
//! near a boundary can therefore see up to `2 * max` hits across two
//! adjacent windows.

mod progressive;

use std::collections::HashMap;

use kinetic_core::{Result, SharedClock, metric_names};
use kinetic_kv::{KeyOptions, KeyValueStore};
use serde::{Deserialize, Serialize};

pub use self::progressive::{ProgressiveDecision, ProgressiveLockout};

const RATE_LIMIT_NAMESPACE: &str = "ratelimit";

/// Window size and request cap of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub window_ms: u64,
    pub max: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max: 100,
        }
    }
}

/// Outcome of one counted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds at which the current window closes.
    pub reset_at_ms: i64,
    /// Whole seconds until the window closes, at least 1.
    pub retry_after_secs: u64,
}

/// Fixed-window counter for a single policy.
#[derive(Clone)]
pub struct RateLimiter {
    store: KeyValueStore,
    clock: SharedClock,
    policy: RateLimitPolicy,
    opts: KeyOptions,
}

impl RateLimiter {
    pub fn new(store: KeyValueStore, clock: SharedClock, policy: RateLimitPolicy) -> Self {
        Self::with_namespace(store, clock, policy, RATE_LIMIT_NAMESPACE)
    }

    /// Limiter whose counters live under `namespace`.
    pub fn with_namespace(
        store: KeyValueStore,
        clock: SharedClock,
        policy: RateLimitPolicy,
        namespace: &str,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
            opts: KeyOptions::namespace(namespace),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Count one request for `identity` under the configured window.
    pub async fn check(&self, identity: &str) -> Result<RateLimitDecision> {
        self.check_with_window(identity, self.policy.window_ms).await
    }

    /// Count one request for `identity` using an explicit window size.
    ///
    /// Store failures are returned to the caller rather than treated as a
    /// zero count.
    pub async fn check_with_window(&self, identity: &str, window_ms: u64) -> Result<RateLimitDecision> {
        let window_ms = window_ms.max(1) as i64;
        let now = self.clock.now_millis();
        let window = now.div_euclid(window_ms);
        let key = format!("{identity}:{window}");
        let ttl_secs = (window_ms as u64).div_ceil(1000);

        let count = self
            .store
            .try_incr_with_expire(&key, ttl_secs, &self.opts)
            .await?;

        let reset_at_ms = (window + 1) * window_ms;
        let count = count.max(0) as u64;
        let allowed = count <= self.policy.max;
        let retry_after_secs = ((reset_at_ms - now).max(0) as u64).div_ceil(1000).max(1);

        Ok(RateLimitDecision {
            allowed,
            limit: self.policy.max,
            remaining: self.policy.max.saturating_sub(count),
            reset_at_ms,
            retry_after_secs,
        })
    }
}

/// How a caller's counter identity is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyGenerator {
    #[default]
    Ip,
    User,
    Tenant,
    ApiKey,
}

/// Attributes of an incoming request relevant to rate limiting.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    pub ip: String,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub api_key: Option<String>,
    pub role: Option<String>,
    pub path: String,
}

impl KeyGenerator {
    /// Counter identity for `request`. Missing attributes fall back to the IP.
    pub fn identity(&self, request: &RequestIdentity) -> String {
        let scoped = match self {
            Self::Ip => None,
            Self::User => request.user_id.as_deref().map(|id| format!("user:{id}")),
            Self::Tenant => request.tenant_id.as_deref().map(|id| format!("tenant:{id}")),
            Self::ApiKey => request.api_key.as_deref().map(|key| format!("apikey:{key}")),
        };
        scoped.unwrap_or_else(|| format!("ip:{}", request.ip))
    }
}

/// Requests that skip rate limiting entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassRules {
    #[serde(default)]
    pub privileged_roles: Vec<String>,
    /// Exact paths, or prefixes when ending in `*`.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
}

impl BypassRules {
    /// Reason for bypassing, if any rule matches.
    pub fn matches(&self, request: &RequestIdentity) -> Option<&'static str> {
        if let Some(role) = request.role.as_deref() {
            if self.privileged_roles.iter().any(|r| r == role) {
                return Some("privileged_role");
            }
        }
        let path_allowed = self.allowed_paths.iter().any(|allowed| {
            match allowed.strip_suffix('*') {
                Some(prefix) => request.path.starts_with(prefix),
                None => request.path == *allowed,
            }
        });
        path_allowed.then_some("allowed_path")
    }
}

/// A group of routes sharing one policy and counter namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteClass {
    pub name: String,
    pub path_prefix: String,
    pub window_ms: u64,
    pub max: u64,
    #[serde(default)]
    pub key_generator: Option<KeyGenerator>,
    #[serde(default)]
    pub progressive: bool,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Policy for requests that match no route class
    #[serde(default)]
    pub default_policy: RateLimitPolicy,

    #[serde(default)]
    pub key_generator: KeyGenerator,

    /// Progressive lockout on the default class
    #[serde(default)]
    pub progressive: bool,

    /// Checked in order; the first matching prefix wins
    #[serde(default = "default_route_classes")]
    pub route_classes: Vec<RouteClass>,

    #[serde(default = "default_privileged_roles")]
    pub privileged_roles: Vec<String>,

    #[serde(default = "default_bypass_paths")]
    pub bypass_paths: Vec<String>,

    /// Also emit `X-Rate-Limit-*` headers
    #[serde(default)]
    pub legacy_headers: bool,

    /// Let requests through when the store cannot be reached
    #[serde(default)]
    pub fail_open_on_error: bool,

    /// Take user, tenant and role from the `X-User-*` / `X-Tenant-Id`
    /// request headers. Only safe behind a proxy that sets them.
    #[serde(default)]
    pub trust_identity_headers: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_route_classes() -> Vec<RouteClass> {
    vec![RouteClass {
        name: "auth".to_string(),
        path_prefix: "/auth".to_string(),
        window_ms: 15 * 60 * 1000,
        max: 10,
        key_generator: Some(KeyGenerator::Ip),
        progressive: true,
    }]
}

fn default_privileged_roles() -> Vec<String> {
    vec!["super_admin".to_string()]
}

fn default_bypass_paths() -> Vec<String> {
    vec!["/healthz".to_string(), "/metrics".to_string()]
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_policy: RateLimitPolicy::default(),
            key_generator: KeyGenerator::default(),
            progressive: false,
            route_classes: default_route_classes(),
            privileged_roles: default_privileged_roles(),
            bypass_paths: default_bypass_paths(),
            legacy_headers: false,
            fail_open_on_error: false,
            trust_identity_headers: false,
        }
    }
}

impl RateLimitSettings {
    pub fn validate(&self) -> std::result::Result<(), String> {
        let policies = std::iter::once(("default", self.default_policy)).chain(
            self.route_classes.iter().map(|class| {
                (
                    class.name.as_str(),
                    RateLimitPolicy {
                        window_ms: class.window_ms,
                        max: class.max,
                    },
                )
            }),
        );
        for (name, policy) in policies {
            if policy.window_ms == 0 {
                return Err(format!("rate_limit.{name}: window_ms must be > 0"));
            }
            if policy.max == 0 {
                return Err(format!("rate_limit.{name}: max must be > 0"));
            }
        }
        Ok(())
    }

    fn bypass_rules(&self) -> BypassRules {
        BypassRules {
            privileged_roles: self.privileged_roles.clone(),
            allowed_paths: self.bypass_paths.clone(),
        }
    }
}

/// Result of running a request through [`RateLimitGuard`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitOutcome {
    /// Skipped before any counter was touched.
    Bypassed { reason: &'static str },
    /// Counted against `class`.
    Decided {
        class: String,
        decision: RateLimitDecision,
    },
}

impl RateLimitOutcome {
    pub fn is_allowed(&self) -> bool {
        match self {
            Self::Bypassed { .. } => true,
            Self::Decided { decision, .. } => decision.allowed,
        }
    }
}

struct ClassLimiter {
    name: String,
    path_prefix: Option<String>,
    key_generator: KeyGenerator,
    limiter: RateLimiter,
    progressive: Option<ProgressiveLockout>,
}

/// Bypass rules plus one base limiter (and optional lockout) per route class.
pub struct RateLimitGuard {
    enabled: bool,
    bypass: BypassRules,
    classes: Vec<ClassLimiter>,
    default_class: ClassLimiter,
}

impl RateLimitGuard {
    pub fn new(store: KeyValueStore, clock: SharedClock, settings: &RateLimitSettings) -> Self {
        let build = |name: &str,
                     path_prefix: Option<String>,
                     policy: RateLimitPolicy,
                     key_generator: KeyGenerator,
                     progressive: bool| {
            let namespace = format!("{RATE_LIMIT_NAMESPACE}:{name}");
            ClassLimiter {
                name: name.to_string(),
                path_prefix,
                key_generator,
                limiter: RateLimiter::with_namespace(store.clone(), clock.clone(), policy, &namespace),
                progressive: progressive.then(|| {
                    ProgressiveLockout::new(store.clone(), clock.clone(), policy, &namespace)
                }),
            }
        };

        let classes = settings
            .route_classes
            .iter()
            .map(|class| {
                build(
                    &class.name,
                    Some(class.path_prefix.clone()),
                    RateLimitPolicy {
                        window_ms: class.window_ms,
                        max: class.max,
                    },
                    class.key_generator.unwrap_or(settings.key_generator),
                    class.progressive,
                )
            })
            .collect();
        let default_class = build(
            "default",
            None,
            settings.default_policy,
            settings.key_generator,
            settings.progressive,
        );

        Self {
            enabled: settings.enabled,
            bypass: settings.bypass_rules(),
            classes,
            default_class,
        }
    }

    fn class_for(&self, path: &str) -> &ClassLimiter {
        self.classes
            .iter()
            .find(|class| {
                class
                    .path_prefix
                    .as_deref()
                    .is_some_and(|prefix| path.starts_with(prefix))
            })
            .unwrap_or(&self.default_class)
    }

    /// Route-class name a path is counted under.
    pub fn class_name(&self, path: &str) -> &str {
        &self.class_for(path).name
    }

    /// Count `request` against its route class.
    ///
    /// Bypass rules are evaluated first so bypassed requests never consume
    /// quota. When the class has a progressive lockout, the base counter and
    /// the lockout's own counter are both incremented for the same request;
    /// the request is rejected if either rejects it.
    pub async fn check(&self, request: &RequestIdentity) -> Result<RateLimitOutcome> {
        if !self.enabled {
            return Ok(RateLimitOutcome::Bypassed { reason: "disabled" });
        }
        if let Some(reason) = self.bypass.matches(request) {
            metrics::counter!(metric_names::RATE_LIMIT_DECISIONS_TOTAL, "result" => "bypassed").increment(1);
            return Ok(RateLimitOutcome::Bypassed { reason });
        }

        let class = self.class_for(&request.path);
        let identity = class.key_generator.identity(request);

        let mut decision = class.limiter.check(&identity).await?;
        if let Some(progressive) = &class.progressive {
            let lockout = progressive.check(&identity).await?;
            if decision.allowed && !lockout.decision.allowed {
                decision = lockout.decision;
            }
        }

        let result = if decision.allowed { "allowed" } else { "rejected" };
        metrics::counter!(metric_names::RATE_LIMIT_DECISIONS_TOTAL, "result" => result).increment(1);
        if !decision.allowed {
            tracing::debug!(
                class = %class.name,
                identity = %identity,
                reset_at_ms = decision.reset_at_ms,
                "Rate limit exceeded"
            );
        }

        Ok(RateLimitOutcome::Decided {
            class: class.name.clone(),
            decision,
        })
    }

    /// Policy of every class, for the admin surface.
    pub fn policies(&self) -> HashMap<String, RateLimitPolicy> {
        self.classes
            .iter()
            .chain(std::iter::once(&self.default_class))
            .map(|class| (class.name.clone(), class.limiter.policy()))
            .collect()
    }
}
