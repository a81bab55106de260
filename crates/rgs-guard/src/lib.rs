//! The remote-access guard (component H): admin-path classification,
//! CIDR trust evaluation, and fail-closed activity logging (§4.H).
//!
//! The guard is deliberately conservative: if it cannot record an
//! attempt it refuses the request, even one from a trusted address,
//! rather than let an admin action through unlogged.

use std::sync::Arc;

use rgs_core::remote_access::RemoteAccessActivity;
use rgs_core::{Clock, RgsError, RgsResult};
use rgs_crypto::TrustedCidrs;
use rgs_storage::{decode, encode, Backend, BackendKind, KvTree};

#[derive(Clone, Debug)]
pub struct GuardConfig {
    /// Path prefixes classified as admin; a trailing `*` matches any
    /// suffix, otherwise the path must match exactly (§4.H, §6 REST path
    /// families marked `[admin]`).
    pub admin_path_globs: Vec<String>,
    /// Cap on the activity log's size while running on the in-memory
    /// fallback backend (§4.H, §5 shared-resource policy). `None` means
    /// unbounded — only sensible when the durable backend is in use.
    pub max_memory_activity_entries: Option<usize>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            admin_path_globs: vec![
                "/v1/reporting/*".to_string(),
                "/v1/config/*".to_string(),
                "/v1/audit/*".to_string(),
            ],
            max_memory_activity_entries: Some(10_000),
        }
    }
}

/// The transport-agnostic facts the guard needs about an inbound
/// request; REST and RPC front ends both build one of these.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub source_ip: String,
    pub source_port: Option<u16>,
    pub destination_host: Option<String>,
    pub destination_port: Option<u16>,
    pub path: String,
    pub method: String,
}

pub struct RemoteAccessGuard {
    activity: Arc<dyn KvTree>,
    trusted: TrustedCidrs,
    clock: Arc<dyn Clock>,
    config: GuardConfig,
    backend_kind: BackendKind,
}

fn glob_match(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    }
}

impl RemoteAccessGuard {
    pub fn new(backend: &Backend, trusted: TrustedCidrs, clock: Arc<dyn Clock>, config: GuardConfig) -> RgsResult<Self> {
        Ok(Self {
            activity: backend.open_tree("remote_access_activity")?,
            trusted,
            clock,
            config,
            backend_kind: backend.kind(),
        })
    }

    pub fn is_admin_path(&self, path: &str) -> bool {
        self.config.admin_path_globs.iter().any(|g| glob_match(g, path))
    }

    /// Classify and, for admin paths, evaluate `ctx` against the trusted
    /// CIDR ring (§4.H). Non-admin paths always pass. An admin path
    /// denies with `Denied("source IP not in trusted CIDR range")` when
    /// untrusted, or `LoggingUnavailable` when the activity sink itself
    /// could not be written — which fires regardless of the CIDR
    /// outcome, trusted included.
    pub async fn evaluate(&self, ctx: RequestContext) -> RgsResult<()> {
        if !self.is_admin_path(&ctx.path) {
            return Ok(());
        }

        let allowed = self.trusted.is_trusted(&ctx.source_ip);
        let reason = if allowed { None } else { Some("source IP not in trusted CIDR range".to_string()) };
        let activity = RemoteAccessActivity {
            activity_id: rgs_core::new_id(),
            occurred_at: self.clock.now(),
            source_ip: ctx.source_ip,
            source_port: ctx.source_port,
            destination_host: ctx.destination_host,
            destination_port: ctx.destination_port,
            path: ctx.path,
            method: ctx.method,
            allowed,
            reason: reason.clone(),
        };

        if self.persist(&activity).is_err() {
            return Err(RgsError::LoggingUnavailable("activity sink unavailable".to_string()));
        }

        if allowed {
            Ok(())
        } else {
            Err(RgsError::Denied(reason.expect("set above when not allowed")))
        }
    }

    fn persist(&self, activity: &RemoteAccessActivity) -> RgsResult<()> {
        if self.backend_kind == BackendKind::InMemory {
            if let Some(cap) = self.config.max_memory_activity_entries {
                if self.activity.len() >= cap {
                    return Err(RgsError::Internal("in-memory activity log at capacity".to_string()));
                }
            }
        }
        self.activity
            .insert(activity.activity_id.as_bytes(), encode(activity)?)
            .map_err(RgsError::from)
    }

    /// Admin inspection op: every recorded access attempt, ordered by
    /// `occurred_at` ascending.
    pub fn list_activity(&self) -> RgsResult<Vec<RemoteAccessActivity>> {
        let mut out = Vec::new();
        for (_, bytes) in self.activity.scan()? {
            out.push(decode::<RemoteAccessActivity>(&bytes)?);
        }
        out.sort_by_key(|a| a.occurred_at);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgs_core::FakeClock;

    fn new_guard(globs: Vec<&str>, cidrs: Vec<&str>) -> RemoteAccessGuard {
        let backend = Backend::in_memory();
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let trusted = TrustedCidrs::parse(&cidrs.into_iter().map(String::from).collect::<Vec<_>>()).unwrap();
        let config = GuardConfig {
            admin_path_globs: globs.into_iter().map(String::from).collect(),
            max_memory_activity_entries: Some(10_000),
        };
        RemoteAccessGuard::new(&backend, trusted, clock, config).unwrap()
    }

    fn ctx(source_ip: &str, path: &str) -> RequestContext {
        RequestContext {
            source_ip: source_ip.to_string(),
            source_port: Some(54321),
            destination_host: None,
            destination_port: None,
            path: path.to_string(),
            method: "GET".to_string(),
        }
    }

    #[tokio::test]
    async fn non_admin_path_always_passes() {
        let guard = new_guard(vec!["/v1/config/*"], vec!["10.0.0.0/8"]);
        guard.evaluate(ctx("203.0.113.1", "/v1/ledger/deposit")).await.unwrap();
    }

    #[tokio::test]
    async fn admin_path_from_trusted_range_passes() {
        let guard = new_guard(vec!["/v1/config/*"], vec!["10.0.0.0/8"]);
        guard.evaluate(ctx("10.0.0.5", "/v1/config/update")).await.unwrap();
        assert_eq!(guard.list_activity().unwrap().len(), 1);
        assert!(guard.list_activity().unwrap()[0].allowed);
    }

    #[tokio::test]
    async fn admin_path_from_untrusted_range_is_denied() {
        let guard = new_guard(vec!["/v1/config/*"], vec!["10.0.0.0/8"]);
        let err = guard.evaluate(ctx("203.0.113.1", "/v1/config/update")).await.unwrap_err();
        assert_eq!(err.wire_reason(), "source IP not in trusted CIDR range");
        assert!(!guard.list_activity().unwrap()[0].allowed);
    }

    #[tokio::test]
    async fn activity_sink_at_capacity_fails_closed_even_when_trusted() {
        let backend = Backend::in_memory();
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let trusted = TrustedCidrs::parse(&["10.0.0.0/8".to_string()]).unwrap();
        let config = GuardConfig {
            admin_path_globs: vec!["/v1/config/*".to_string()],
            max_memory_activity_entries: Some(1),
        };
        let guard = RemoteAccessGuard::new(&backend, trusted, clock, config).unwrap();

        guard.evaluate(ctx("10.0.0.5", "/v1/config/a")).await.unwrap();
        let err = guard.evaluate(ctx("10.0.0.5", "/v1/config/b")).await.unwrap_err();
        assert!(matches!(err, RgsError::LoggingUnavailable(_)));
    }
}
