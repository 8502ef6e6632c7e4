//! Transport factory and tunnel pool
//!
//! The pool maps a profile key to either a pending creation attempt or a
//! live tunnel. Only live, open tunnels are ever handed out or reported.
//!
//! Concurrent requests for a key whose creation is still pending are not
//! coalesced: each starts its own attempt and the first one to complete
//! becomes the pooled tunnel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use iap_core::{ProfileKey, TransportFailed, TunnelError, TunnelProfile};

use super::Transport;
use crate::events::{EventSink, TunnelEvent};
use crate::tunnel::{Tunnel, TunnelFactory, TunnelId};

enum PoolEntry {
    /// Creation attempt in flight
    Pending(u64),
    /// Completed tunnel
    Live(Arc<Tunnel>),
}

impl PoolEntry {
    fn healthy(&self) -> Option<&Arc<Tunnel>> {
        match self {
            PoolEntry::Live(tunnel) if !tunnel.is_closed() => Some(tunnel),
            _ => None,
        }
    }
}

struct PoolState {
    entries: DashMap<ProfileKey, PoolEntry>,
    events: Arc<dyn EventSink>,
    next_attempt: AtomicU64,
}

impl PoolState {
    fn lookup(&self, key: &ProfileKey) -> Option<Arc<Tunnel>> {
        self.entries
            .get(key)
            .and_then(|entry| entry.healthy().cloned())
    }

    /// Record a creation attempt unless a healthy tunnel is already pooled
    fn register_pending(&self, key: &ProfileKey) -> u64 {
        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let replaced = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().healthy().is_some() {
                    None
                } else {
                    Some(occupied.insert(PoolEntry::Pending(attempt)))
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PoolEntry::Pending(attempt));
                None
            }
        };
        drop(replaced);
        attempt
    }

    /// Make `tunnel` the pooled tunnel unless another healthy one won the race
    fn promote(&self, key: &ProfileKey, tunnel: &Arc<Tunnel>) -> bool {
        let (pooled, replaced) = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().healthy().is_some() {
                    (false, None)
                } else {
                    (true, Some(occupied.insert(PoolEntry::Live(Arc::clone(tunnel)))))
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PoolEntry::Live(Arc::clone(tunnel)));
                (true, None)
            }
        };
        drop(replaced);
        pooled
    }

    /// Drop the entry for a failed or abandoned attempt
    fn abandon(&self, key: &ProfileKey, attempt: u64) {
        let removed = self
            .entries
            .remove_if(key, |_, entry| matches!(entry, PoolEntry::Pending(a) if *a == attempt));
        drop(removed);
    }

    /// Remove a closed tunnel and publish `Closed`
    fn on_tunnel_closed(&self, key: &ProfileKey, id: TunnelId, tunnel: Option<Arc<Tunnel>>) {
        let removed = self.entries.remove_if(key, |_, entry| {
            matches!(entry, PoolEntry::Live(pooled) if pooled.id() == id)
        });

        let tunnel = match removed {
            Some((_, PoolEntry::Live(pooled))) => {
                tracing::info!("Removed tunnel {} from pool", id);
                Some(pooled)
            }
            _ => tunnel,
        };

        match tunnel {
            Some(tunnel) => self.events.publish(TunnelEvent::Closed(tunnel)),
            None => tracing::debug!("Tunnel {} dropped before close could be published", id),
        }
    }
}

/// Removes the pending entry on every exit path, including cancellation
struct PendingGuard<'a> {
    state: &'a PoolState,
    key: &'a ProfileKey,
    attempt: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.state.abandon(self.key, self.attempt);
    }
}

/// Hands out transports, reusing healthy pooled tunnels
pub struct TransportFactory {
    state: Arc<PoolState>,
    tunnel_factory: Arc<dyn TunnelFactory>,
}

impl TransportFactory {
    pub fn new(tunnel_factory: Arc<dyn TunnelFactory>, events: Arc<dyn EventSink>) -> Self {
        Self {
            state: Arc::new(PoolState {
                entries: DashMap::new(),
                events,
                next_attempt: AtomicU64::new(0),
            }),
            tunnel_factory,
        }
    }

    /// Live, healthy tunnels currently in the pool
    pub fn pool(&self) -> Vec<Arc<Tunnel>> {
        self.state
            .entries
            .iter()
            .filter_map(|entry| entry.value().healthy().cloned())
            .collect()
    }

    /// Get a transport for `profile`, creating a tunnel if none is pooled
    pub async fn create_transport(
        &self,
        profile: TunnelProfile,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Transport, TransportFailed> {
        if !profile.is_permitted() {
            return Err(TunnelError::PolicyDenied {
                policy: profile.policy().id().to_string(),
                target: format!("{}:{}", profile.target_instance(), profile.target_port()),
            }
            .into());
        }

        if cancel.is_cancelled() {
            return Err(TunnelError::Cancelled.into());
        }

        let key = profile.key();
        if let Some(tunnel) = self.state.lookup(&key) {
            tracing::debug!("Reusing pooled tunnel {} for {}", tunnel.id(), profile);
            return Ok(self.transport_for(tunnel, &profile));
        }

        let attempt = self.state.register_pending(&key);
        let guard = PendingGuard {
            state: &self.state,
            key: &key,
            attempt,
        };

        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
            result = tokio::time::timeout(
                timeout,
                self.tunnel_factory.create_tunnel(&profile, timeout, cancel),
            ) => match result {
                Ok(result) => result,
                Err(_) => Err(TunnelError::Timeout(timeout)),
            },
        };

        let tunnel = match created {
            Ok(tunnel) => tunnel,
            Err(e) => {
                drop(guard);
                let failed = TransportFailed::new(e);
                tracing::warn!("Creating transport for {} failed: {}", profile, failed);
                return Err(failed);
            }
        };

        if self.state.promote(&key, &tunnel) {
            tracing::info!("Added tunnel {} to pool for {}", tunnel.id(), profile);
        } else {
            tracing::debug!(
                "Tunnel {} for {} lost the race to a pooled tunnel",
                tunnel.id(),
                profile
            );
        }
        drop(guard);

        self.state.events.publish(TunnelEvent::Created(Arc::clone(&tunnel)));
        self.watch_close(key, &tunnel);

        Ok(self.transport_for(tunnel, &profile))
    }

    fn watch_close(&self, key: ProfileKey, tunnel: &Arc<Tunnel>) {
        let state: Weak<PoolState> = Arc::downgrade(&self.state);
        let weak_tunnel = Arc::downgrade(tunnel);
        tunnel.on_closed(move |closed| {
            if let Some(state) = state.upgrade() {
                state.on_tunnel_closed(&key, closed.id(), weak_tunnel.upgrade());
            }
        });
    }

    fn transport_for(&self, tunnel: Arc<Tunnel>, profile: &TunnelProfile) -> Transport {
        Transport::new(
            tunnel,
            Arc::clone(profile.protocol()),
            profile.target_instance().clone(),
        )
    }
}
