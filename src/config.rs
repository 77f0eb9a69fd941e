//! Simulator configuration.
//!
//! Options are plain serde-derivable structs injected through
//! constructors; there is no global configuration state. Persistence is
//! opt-in per gateway family: with `persist_root` unset everything lives
//! in memory, and with it set each gateway derives its directory from the
//! layout helpers here (`<root>/kv/<namespace>`, `<root>/cache/<name>`,
//! `<root>/r2/<bucket>`, `<root>/do/<namespace>`, `<root>/queues`).
//!
//! # Examples
//!
//! ```rust
//! use kumo::config::KumoOptions;
//!
//! let options = KumoOptions {
//!     port: 8788,
//!     persist_root: Some("/tmp/kumo".into()),
//!     ..Default::default()
//! };
//! assert_eq!(
//!     options.kv_persist_path("NS").unwrap(),
//!     std::path::PathBuf::from("/tmp/kumo/kv/NS")
//! );
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level simulator options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KumoOptions {
    /// Bind host for the HTTP front-end.
    pub host: String,
    /// Bind port for the HTTP front-end.
    pub port: u16,
    /// Root directory for persisted gateway state; `None` keeps
    /// everything in memory.
    pub persist_root: Option<PathBuf>,
    /// Globally enables or disables the cache gateway. Disabled caches
    /// silently drop writes and never hit.
    pub cache: bool,
    /// Warn once on the first cache put, as on a non-custom subdomain.
    pub cache_warn_usage: bool,
    /// External-subrequest budget per request context.
    pub external_subrequest_limit: Option<usize>,
    /// Attach pseudo-stacks to JSON error bodies, flagged with the
    /// `MF-Experimental-Error-Stack` header.
    pub experimental_error_stack: bool,
}

impl Default for KumoOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            persist_root: None,
            cache: true,
            cache_warn_usage: false,
            external_subrequest_limit: Some(50),
            experimental_error_stack: false,
        }
    }
}

impl KumoOptions {
    /// Persistence directory for a KV namespace.
    pub fn kv_persist_path(&self, namespace: &str) -> Option<PathBuf> {
        self.persist_root.as_ref().map(|r| r.join("kv").join(namespace))
    }

    /// Persistence directory for a named cache.
    pub fn cache_persist_path(&self, name: &str) -> Option<PathBuf> {
        self.persist_root.as_ref().map(|r| r.join("cache").join(name))
    }

    /// Persistence directory for an object-store bucket.
    pub fn r2_persist_path(&self, bucket: &str) -> Option<PathBuf> {
        self.persist_root.as_ref().map(|r| r.join("r2").join(bucket))
    }

    /// Persistence directory for a durable-object namespace.
    pub fn do_persist_path(&self, namespace: &str) -> Option<PathBuf> {
        self.persist_root.as_ref().map(|r| r.join("do").join(namespace))
    }

    /// Persistence directory for queue write-ahead logs.
    pub fn queues_persist_path(&self) -> Option<PathBuf> {
        self.persist_root.as_ref().map(|r| r.join("queues"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_local_and_in_memory() {
        let options = KumoOptions::default();
        assert_eq!(options.host, "127.0.0.1");
        assert_eq!(options.port, 8787);
        assert!(options.cache);
        assert!(options.kv_persist_path("NS").is_none());
    }

    #[test]
    fn persist_layout() {
        let options = KumoOptions {
            persist_root: Some("/data".into()),
            ..Default::default()
        };
        assert_eq!(
            options.cache_persist_path("default").unwrap(),
            PathBuf::from("/data/cache/default")
        );
        assert_eq!(
            options.r2_persist_path("media").unwrap(),
            PathBuf::from("/data/r2/media")
        );
        assert_eq!(
            options.queues_persist_path().unwrap(),
            PathBuf::from("/data/queues")
        );
    }

    #[test]
    fn options_round_trip_through_json() {
        let options = KumoOptions {
            port: 9000,
            cache: false,
            ..Default::default()
        };
        let json = serde_json::to_string(&options).unwrap();
        let back: KumoOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, 9000);
        assert!(!back.cache);
    }
}
