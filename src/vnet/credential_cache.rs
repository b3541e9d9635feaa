//! Per-username SSH client config cache with single-flight issuance
//!
//! # Invariants
//!
//! - At most one issuance per username is in flight. Concurrent callers for
//!   the same username await the same shared future and observe the same
//!   `Arc` (or the same error).
//! - An entry is stored only after issuance fully succeeded. Failures store
//!   nothing.
//! - Entries leave the cache only through [`UserConfigCache::invalidate`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::debug;

use super::error::VnetError;
use super::provider::UserSshConfig;

type Flight = Shared<BoxFuture<'static, Result<Arc<UserSshConfig>, Arc<VnetError>>>>;

#[derive(Default)]
pub struct UserConfigCache {
    configs: DashMap<String, Arc<UserSshConfig>>,
    in_flight: Mutex<HashMap<String, Flight>>,
}

impl UserConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached config for `username`, or the result of `issue` shared with every
    /// concurrent caller asking for the same username.
    ///
    /// `issue` is only called by the caller that starts a flight.
    pub async fn get_or_issue<F, Fut>(
        &self,
        username: &str,
        issue: F,
    ) -> Result<Arc<UserSshConfig>, VnetError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<UserSshConfig, VnetError>> + Send + 'static,
    {
        if let Some(config) = self.configs.get(username) {
            return Ok(config.clone());
        }

        let flight = {
            let mut in_flight = self.in_flight.lock();
            // A flight may have stored its result between the fast path and the lock.
            if let Some(config) = self.configs.get(username) {
                return Ok(config.clone());
            }
            in_flight
                .entry(username.to_string())
                .or_insert_with(|| {
                    debug!(username = %username, "Issuing user SSH client config");
                    let fut = issue();
                    async move { fut.await.map(Arc::new).map_err(Arc::new) }
                        .boxed()
                        .shared()
                })
                .clone()
        };

        let result = flight.clone().await;

        {
            let mut in_flight = self.in_flight.lock();
            // First waiter to get here publishes the result and retires the flight.
            if in_flight
                .get(username)
                .is_some_and(|current| current.ptr_eq(&flight))
            {
                in_flight.remove(username);
                if let Ok(config) = &result {
                    self.configs.insert(username.to_string(), config.clone());
                }
            }
        }

        result.map_err(VnetError::Shared)
    }

    /// Drop the cached config so the next lookup issues a fresh one.
    pub fn invalidate(&self, username: &str) {
        if self.configs.remove(username).is_some() {
            debug!(username = %username, "Invalidated cached user SSH client config");
        }
    }

    pub fn get(&self, username: &str) -> Option<Arc<UserSshConfig>> {
        self.configs.get(username).map(|c| c.clone())
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}
