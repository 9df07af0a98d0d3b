//! Per-run name registry: the discovery service workers register with and
//! the master reads worker handles from.
//!
//! The registry is an explicit service instance with an owned lifecycle
//! (`start` / `shutdown`), handed around by `Arc` — never global state. It
//! reserves its TCP port for the lifetime of the run so two runs cannot
//! claim the same endpoint, while registration itself is in-process.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use hb_types::{HbResult, RegistryError};

use crate::worker::WorkerCommand;

/// Reachability state of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Idle,
    Busy,
    Offline,
}

/// Discovery record for one worker. Owned by the registry; the master
/// holds copies for dispatch.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub address: String,
    /// Maximum concurrent jobs this worker accepts.
    pub capacity: usize,
    pub state: WorkerState,
    pub dispatch_tx: mpsc::UnboundedSender<WorkerCommand>,
}

/// Registry of reachable workers for one `run_id`.
pub struct NameRegistry {
    run_id: String,
    host: String,
    port: u16,
    /// Holds the bound socket so the port stays reserved for this run.
    _listener: TcpListener,
    entries: DashMap<String, WorkerHandle>,
    /// address -> worker_id, for duplicate-address detection.
    addresses: DashMap<String, String>,
    /// Side channel notified whenever a worker goes offline.
    offline_alerts: RwLock<Option<crossbeam_channel::Sender<String>>>,
    shut_down: AtomicBool,
}

impl NameRegistry {
    /// Start a registry for `run_id`, reserving `host:port`. Port 0 picks
    /// a free ephemeral port. Fails fast with `PortInUse` if the requested
    /// port is taken.
    pub fn start(run_id: impl Into<String>, host: &str, port: u16) -> HbResult<Arc<Self>> {
        let run_id = run_id.into();
        let listener = TcpListener::bind((host, port)).map_err(|_| RegistryError::PortInUse {
            host: host.to_string(),
            port,
        })?;
        let bound_port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(port);

        info!(run_id = %run_id, host, port = bound_port, "name registry started");
        Ok(Arc::new(Self {
            run_id,
            host: host.to_string(),
            port: bound_port,
            _listener: listener,
            entries: DashMap::new(),
            addresses: DashMap::new(),
            offline_alerts: RwLock::new(None),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port actually bound (relevant when started with port 0).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Register a worker, or update its address if the worker_id is
    /// already known. Fails if a *different* worker claims the address.
    pub fn register(
        &self,
        worker_id: &str,
        address: &str,
        capacity: usize,
        dispatch_tx: mpsc::UnboundedSender<WorkerCommand>,
    ) -> HbResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(RegistryError::ShutDown.into());
        }

        if let Some(claimed_by) = self.addresses.get(address) {
            if claimed_by.value() != worker_id {
                return Err(RegistryError::DuplicateAddress {
                    address: address.to_string(),
                    claimed_by: claimed_by.value().clone(),
                }
                .into());
            }
        }

        // Re-registration releases the worker's previous address claim.
        if let Some(previous) = self.entries.get(worker_id) {
            if previous.address != address {
                self.addresses.remove(&previous.address);
            }
        }

        self.addresses
            .insert(address.to_string(), worker_id.to_string());
        self.entries.insert(
            worker_id.to_string(),
            WorkerHandle {
                worker_id: worker_id.to_string(),
                address: address.to_string(),
                capacity: capacity.max(1),
                state: WorkerState::Idle,
                dispatch_tx,
            },
        );
        debug!(run_id = %self.run_id, worker = %worker_id, address, "worker registered");
        Ok(())
    }

    /// Register with bounded backoff. Registration is in-process and only
    /// fails transiently around shutdown races, but workers treat the
    /// registry like any remote dependency.
    pub async fn register_with_retry(
        &self,
        worker_id: &str,
        address: &str,
        capacity: usize,
        dispatch_tx: mpsc::UnboundedSender<WorkerCommand>,
        attempts: u32,
    ) -> HbResult<()> {
        let mut backoff = Duration::from_millis(10);
        let mut last_err = None;
        for _ in 0..attempts.max(1) {
            match self.register(worker_id, address, capacity, dispatch_tx.clone()) {
                Ok(()) => return Ok(()),
                // Contract errors are not retryable.
                Err(err @ hb_types::HbError::Registry(RegistryError::DuplicateAddress { .. })) => {
                    return Err(err)
                }
                Err(err) => {
                    warn!(worker = %worker_id, error = %err, "registration failed, retrying");
                    last_err = Some(err);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RegistryError::ShutDown.into()))
    }

    /// Snapshot of all reachable (non-offline) workers.
    pub fn list_workers(&self) -> Vec<WorkerHandle> {
        let mut workers: Vec<WorkerHandle> = self
            .entries
            .iter()
            .filter(|entry| entry.state != WorkerState::Offline)
            .map(|entry| entry.value().clone())
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    pub fn set_state(&self, worker_id: &str, state: WorkerState) -> HbResult<()> {
        match self.entries.get_mut(worker_id) {
            Some(mut entry) => {
                entry.state = state;
                Ok(())
            }
            None => Err(RegistryError::UnknownWorker {
                worker_id: worker_id.to_string(),
            }
            .into()),
        }
    }

    /// Mark a worker unreachable and push an offline alert if a channel is
    /// installed.
    pub fn mark_offline(&self, worker_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(worker_id) {
            entry.state = WorkerState::Offline;
        }
        warn!(run_id = %self.run_id, worker = %worker_id, "worker offline");
        if let Some(alerts) = self.offline_alerts.read().as_ref() {
            let _ = alerts.send(worker_id.to_string());
        }
    }

    /// Remove a worker and release its address claim.
    pub fn deregister(&self, worker_id: &str) {
        if let Some((_, handle)) = self.entries.remove(worker_id) {
            self.addresses.remove(&handle.address);
            debug!(run_id = %self.run_id, worker = %worker_id, "worker deregistered");
        }
    }

    /// Install a side channel that receives worker ids as they go offline.
    pub fn set_offline_alerts(&self, alerts: crossbeam_channel::Sender<String>) {
        *self.offline_alerts.write() = Some(alerts);
    }

    /// Release all registered entries. Safe to call even if no worker ever
    /// connected, and idempotent.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.entries.clear();
        self.addresses.clear();
        info!(run_id = %self.run_id, "name registry shut down");
    }
}
