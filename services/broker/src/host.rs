//! Virtual hosts.
//!
//! A CONNECT binds the session to one virtual host, resolved from the
//! `host` header (or the registry's default). The host carries everything
//! the connection needs afterwards: its router, an optional authenticator,
//! an optional store, an optional read-buffer pool, and the session counter
//! that makes session ids unique per host.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use stomp_wire::BufferPool;

use crate::config::BrokerConfig;
use crate::router::{MemoryRouter, Router};
use crate::store::{MemoryStore, Store};

/// Credentials presented in a CONNECT frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityContext {
    pub login: Option<String>,
    pub passcode: Option<String>,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, ctx: &SecurityContext) -> BoxFuture<'_, bool>;
}

/// Authenticator backed by the host's configured login/passcode table.
pub struct UserTableAuthenticator {
    users: HashMap<String, String>,
}

impl UserTableAuthenticator {
    pub fn new(users: HashMap<String, String>) -> UserTableAuthenticator {
        UserTableAuthenticator { users }
    }
}

impl Authenticator for UserTableAuthenticator {
    fn authenticate(&self, ctx: &SecurityContext) -> BoxFuture<'_, bool> {
        let ok = match (&ctx.login, &ctx.passcode) {
            (Some(login), Some(passcode)) => self.users.get(login) == Some(passcode),
            _ => false,
        };
        Box::pin(std::future::ready(ok))
    }
}

pub struct VirtualHost {
    pub id: String,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub store: Option<Arc<dyn Store>>,
    pub buffer_pool: Option<Arc<BufferPool>>,
    pub router: Arc<dyn Router>,
    session_counter: AtomicU64,
}

impl VirtualHost {
    pub fn next_session(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub struct HostRegistry {
    hosts: HashMap<String, Arc<VirtualHost>>,
    default_host: String,
}

impl HostRegistry {
    /// Build the hosts a config describes. The config layer guarantees at
    /// least one host and exactly one default.
    pub fn from_config(config: &BrokerConfig) -> HostRegistry {
        let mut hosts = HashMap::new();
        let mut default_host = String::new();
        for vh in &config.virtual_hosts {
            let authenticator: Option<Arc<dyn Authenticator>> = if vh.users.is_empty() {
                None
            } else {
                Some(Arc::new(UserTableAuthenticator::new(vh.users.clone())))
            };
            let store: Option<Arc<dyn Store>> = if vh.store {
                Some(Arc::new(MemoryStore::new()))
            } else {
                None
            };
            let buffer_pool = vh
                .read_buffer_bytes
                .map(|size| Arc::new(BufferPool::new(size)));
            let router: Arc<dyn Router> =
                Arc::new(MemoryRouter::with_buffer(vh.destination_buffer));
            if vh.default_host {
                default_host = vh.id.clone();
            }
            hosts.insert(
                vh.id.clone(),
                Arc::new(VirtualHost {
                    id: vh.id.clone(),
                    authenticator,
                    store,
                    buffer_pool,
                    router,
                    session_counter: AtomicU64::new(0),
                }),
            );
        }
        HostRegistry {
            hosts,
            default_host,
        }
    }

    /// Resolve the `host` header; absent means the default host.
    pub fn lookup(&self, name: Option<&str>) -> Option<Arc<VirtualHost>> {
        let name = name.unwrap_or(&self.default_host);
        self.hosts.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VirtualHostConfig;

    fn registry(hosts: Vec<VirtualHostConfig>) -> HostRegistry {
        let config = BrokerConfig {
            virtual_hosts: hosts,
            ..BrokerConfig::default()
        };
        HostRegistry::from_config(&config)
    }

    #[test]
    fn lookup_falls_back_to_the_default_host() {
        let reg = registry(vec![
            VirtualHostConfig {
                id: "main".to_owned(),
                default_host: true,
                ..VirtualHostConfig::default()
            },
            VirtualHostConfig {
                id: "other".to_owned(),
                ..VirtualHostConfig::default()
            },
        ]);
        assert_eq!(reg.lookup(None).unwrap().id, "main");
        assert_eq!(reg.lookup(Some("other")).unwrap().id, "other");
        assert!(reg.lookup(Some("missing")).is_none());
    }

    #[test]
    fn session_ids_are_monotonic_per_host() {
        let reg = registry(vec![VirtualHostConfig {
            id: "main".to_owned(),
            default_host: true,
            ..VirtualHostConfig::default()
        }]);
        let host = reg.lookup(None).unwrap();
        assert_eq!(host.next_session(), 1);
        assert_eq!(host.next_session(), 2);
    }

    #[tokio::test]
    async fn user_table_authenticator_checks_login_and_passcode() {
        let mut users = HashMap::new();
        users.insert("alice".to_owned(), "secret".to_owned());
        let auth = UserTableAuthenticator::new(users);

        let ok = SecurityContext {
            login: Some("alice".to_owned()),
            passcode: Some("secret".to_owned()),
        };
        assert!(auth.authenticate(&ok).await);

        let bad_pass = SecurityContext {
            login: Some("alice".to_owned()),
            passcode: Some("wrong".to_owned()),
        };
        assert!(!auth.authenticate(&bad_pass).await);

        assert!(!auth.authenticate(&SecurityContext::default()).await);
    }
}
