//! Registry of tunnels keyed by destination.
//!
//! At most one live tunnel exists per destination. Concurrent requests for
//! the same destination share one creation: the first request installs a
//! pending slot holding a shared future, later requests await that same
//! future and observe the same result.

use crate::endpoint::TunnelDestination;
use crate::error::{TunnelError, TunnelResult};
use crate::tunnel::TunnelStatus;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// What the registry needs from a tunnel.
pub trait TunnelHandle: Send + Sync + 'static {
    fn local_port(&self) -> u16;

    fn is_alive(&self) -> bool;

    /// Current status, including the cause if the tunnel failed.
    fn status(&self) -> TunnelStatus;

    /// Begin closing. Must not block.
    fn close(&self);
}

type Creation<T> = Shared<BoxFuture<'static, TunnelResult<Arc<T>>>>;

enum Slot<T> {
    Pending { id: u64, creation: Creation<T> },
    Live(Arc<T>),
}

enum Lookup<T> {
    Live(Arc<T>),
    Pending(u64, Creation<T>),
    Stale,
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Live tunnels.
    pub live: usize,
    /// Creations in progress.
    pub pending: usize,
    /// Tunnels created since startup.
    pub created: usize,
    /// Requests answered with an existing tunnel.
    pub reused: usize,
}

pub struct Registry<T> {
    slots: DashMap<TunnelDestination, Slot<T>>,
    next_id: AtomicU64,
    created: AtomicUsize,
    reused: AtomicUsize,
}

impl<T: TunnelHandle> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TunnelHandle> Registry<T> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
            created: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        }
    }

    fn start<F>(&self, create: F) -> (u64, Creation<T>)
    where
        F: FnOnce() -> BoxFuture<'static, TunnelResult<T>>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let creation = create().map(|result| result.map(Arc::new)).boxed().shared();
        (id, creation)
    }

    /// Get the live tunnel for `destination`, or create one with `create`.
    pub async fn get_or_create<F>(
        &self,
        destination: &TunnelDestination,
        create: F,
    ) -> TunnelResult<Arc<T>>
    where
        F: FnOnce() -> BoxFuture<'static, TunnelResult<T>>,
    {
        let (id, creation) = match self.slots.entry(destination.clone()) {
            Entry::Occupied(mut occupied) => {
                let lookup = match occupied.get() {
                    Slot::Live(tunnel) if tunnel.is_alive() => Lookup::Live(tunnel.clone()),
                    Slot::Live(_) => Lookup::Stale,
                    Slot::Pending { id, creation } => Lookup::Pending(*id, creation.clone()),
                };
                match lookup {
                    Lookup::Live(tunnel) => {
                        self.reused.fetch_add(1, Ordering::Relaxed);
                        trace!("Reusing tunnel to {}", destination);
                        return Ok(tunnel);
                    }
                    Lookup::Pending(id, creation) => {
                        debug!("Joining pending tunnel creation for {}", destination);
                        (id, creation)
                    }
                    Lookup::Stale => {
                        debug!("Replacing dead tunnel to {}", destination);
                        let (id, creation) = self.start(create);
                        occupied.insert(Slot::Pending {
                            id,
                            creation: creation.clone(),
                        });
                        (id, creation)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let (id, creation) = self.start(create);
                vacant.insert(Slot::Pending {
                    id,
                    creation: creation.clone(),
                });
                (id, creation)
            }
        };

        let result = creation.await;
        self.settle(destination, id, result)
    }

    /// Record the outcome of creation `id`. Every waiter calls this; the
    /// first one to find its pending slot settles it.
    fn settle(
        &self,
        destination: &TunnelDestination,
        id: u64,
        result: TunnelResult<Arc<T>>,
    ) -> TunnelResult<Arc<T>> {
        let superseded = match self.slots.entry(destination.clone()) {
            Entry::Occupied(mut occupied) => {
                let ours =
                    matches!(occupied.get(), Slot::Pending { id: pending, .. } if *pending == id);
                if ours {
                    match &result {
                        Ok(tunnel) => {
                            occupied.insert(Slot::Live(tunnel.clone()));
                            self.created.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            occupied.remove();
                        }
                    }
                    false
                } else {
                    match (occupied.get(), &result) {
                        (Slot::Live(live), Ok(tunnel)) => !Arc::ptr_eq(live, tunnel),
                        (_, result) => result.is_ok(),
                    }
                }
            }
            Entry::Vacant(_) => result.is_ok(),
        };

        if superseded {
            // The registry was cleared while this tunnel was being created.
            if let Ok(tunnel) = &result {
                tunnel.close();
            }
            return Err(TunnelError::closed(format!(
                "Tunnels were closed while connecting to {}",
                destination
            )));
        }
        result
    }

    /// The live tunnel for `destination`, if any.
    pub fn get(&self, destination: &TunnelDestination) -> Option<Arc<T>> {
        match self.slots.get(destination)?.value() {
            Slot::Live(tunnel) if tunnel.is_alive() => Some(tunnel.clone()),
            _ => None,
        }
    }

    /// The most recent tunnel for `destination`, dead or alive. A dead
    /// tunnel stays until it is replaced or the registry is cleared.
    pub fn latest(&self, destination: &TunnelDestination) -> Option<Arc<T>> {
        match self.slots.get(destination)?.value() {
            Slot::Live(tunnel) => Some(tunnel.clone()),
            Slot::Pending { .. } => None,
        }
    }

    pub fn is_live(&self, destination: &TunnelDestination) -> bool {
        self.get(destination).is_some()
    }

    /// Live tunnels, in no particular order.
    pub fn snapshot(&self) -> Vec<(TunnelDestination, Arc<T>)> {
        self.slots
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Live(tunnel) if tunnel.is_alive() => {
                    Some((entry.key().clone(), tunnel.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Close and forget every tunnel, including those still being created.
    /// Returns the number of live tunnels closed.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        self.slots.retain(|destination, slot| {
            if let Slot::Live(tunnel) = slot {
                debug!("Closing tunnel to {}", destination);
                tunnel.close();
                closed += 1;
            }
            false
        });
        closed
    }

    pub fn stats(&self) -> RegistryStats {
        let mut live = 0;
        let mut pending = 0;
        for entry in self.slots.iter() {
            match entry.value() {
                Slot::Live(tunnel) if tunnel.is_alive() => live += 1,
                Slot::Live(_) => {}
                Slot::Pending { .. } => pending += 1,
            }
        }

        RegistryStats {
            live,
            pending,
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }
}
