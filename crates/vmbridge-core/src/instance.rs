//! VM Instance: one handle, one engine object, one lifecycle.
//!
//! All state transitions happen under the instance mutex; the mutex is never
//! held across an `.await`. The per-instance operation token is a single
//! permit [`Semaphore`]: create, start and stop take it at request time and
//! give it back when their result is committed. Teardown takes it too, so
//! an engine object is never released while a call into it is in flight.

use crate::error::{BridgeError, Result};
use crate::events::Events;
use crate::handle::Handle;
use crate::operation::OperationKind;
use crate::state::{Event, LifecycleState, StateCell};
use crate::validate::{self, DiskClaim, ValidatedConfig};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use vmbridge_vm::EngineVm;

/// Proof that an operation was accepted and holds the instance token.
pub(crate) struct Ticket {
    kind: OperationKind,
    permit: OwnedSemaphorePermit,
    vm: Option<Arc<dyn EngineVm>>,
}

impl Ticket {
    /// The engine object, present for start and stop.
    pub(crate) fn vm(&self) -> Option<Arc<dyn EngineVm>> {
        self.vm.clone()
    }
}

/// Everything a successful create hands to the instance.
pub(crate) struct Allocation {
    pub(crate) vm: Arc<dyn EngineVm>,
    pub(crate) config: ValidatedConfig,
    pub(crate) claim: DiskClaim,
    /// Disk images this create made, removed if the instance dies first.
    pub(crate) created_disks: Vec<PathBuf>,
}

/// Engine object and token handed to a teardown task.
pub(crate) struct Teardown {
    vm: Option<Arc<dyn EngineVm>>,
    running: bool,
    remove_disks: Vec<PathBuf>,
    // Released after the images are gone.
    _claim: Option<DiskClaim>,
    _permit: OwnedSemaphorePermit,
}

impl Teardown {
    /// Internal stop if the guest is running, then release.
    pub(crate) async fn run(self, handle: Handle) {
        let Some(vm) = self.vm else {
            return;
        };

        if self.running {
            if let Err(e) = vm.stop().await {
                tracing::warn!(%handle, error = %e, "Stop during teardown failed");
            }
        }
        vm.release().await;
        validate::remove_disks(&self.remove_disks).await;
        tracing::info!(%handle, "VM torn down");
    }
}

/// What happened when an operation tried to commit its result.
pub(crate) enum Settled {
    /// The transition was applied.
    Committed(LifecycleState),
    /// The instance was destroyed in the meantime.
    TornDown(Teardown),
}

struct Inner {
    config: Option<ValidatedConfig>,
    vm: Option<Arc<dyn EngineVm>>,
    claim: Option<DiskClaim>,
    outstanding: Option<OperationKind>,
    torn_down: bool,
}

pub(crate) struct Instance {
    handle: Handle,
    created_at: DateTime<Utc>,
    state: StateCell,
    inner: Mutex<Inner>,
    token: Arc<Semaphore>,
    events: Events,
}

impl Instance {
    pub(crate) fn new(handle: Handle, events: Events) -> Self {
        Self {
            handle,
            created_at: Utc::now(),
            state: StateCell::new(LifecycleState::Uninitialized),
            inner: Mutex::new(Inner {
                config: None,
                vm: None,
                claim: None,
                outstanding: None,
                torn_down: false,
            }),
            token: Arc::new(Semaphore::new(1)),
            events,
        }
    }

    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }

    pub(crate) fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last committed state. Lock-free.
    pub(crate) fn state(&self) -> LifecycleState {
        self.state.get()
    }

    pub(crate) fn config(&self) -> Option<ValidatedConfig> {
        self.lock().config.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `event` and broadcast the change. Caller holds the lock.
    fn apply(&self, event: Event) -> std::result::Result<LifecycleState, LifecycleState> {
        let from = self.state.get();
        let to = self.state.apply(event)?;
        self.events.emit(self.handle, from, to);
        Ok(to)
    }

    /// Accept `kind` or reject it synchronously.
    ///
    /// On success the token is held and the requested transition has been
    /// applied.
    pub(crate) fn begin(&self, kind: OperationKind) -> Result<Ticket> {
        let requested = match kind {
            OperationKind::Create => Event::CreateRequested,
            OperationKind::Start => Event::StartRequested,
            OperationKind::Stop => Event::StopRequested,
            OperationKind::VsockConnect | OperationKind::ListInterfaces => {
                return Err(BridgeError::InvalidState {
                    operation: kind,
                    state: self.state(),
                })
            }
        };

        let mut inner = self.lock();
        if inner.torn_down {
            return Err(BridgeError::UnknownHandle(self.handle));
        }

        let permit = match Arc::clone(&self.token).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                return Err(BridgeError::Busy {
                    requested: kind,
                    outstanding: inner.outstanding.unwrap_or(kind),
                })
            }
        };

        self.apply(requested)
            .map_err(|state| BridgeError::InvalidState {
                operation: kind,
                state,
            })?;

        inner.outstanding = Some(kind);
        tracing::debug!(
            handle = %self.handle,
            op = %kind,
            state = %self.state(),
            "Operation accepted"
        );

        Ok(Ticket {
            kind,
            permit,
            vm: inner.vm.clone(),
        })
    }

    /// Commit the outcome of a create.
    ///
    /// On success the engine object, configuration and disk claim are
    /// installed.
    pub(crate) fn settle_create(&self, ticket: Ticket, created: Option<Allocation>) -> Settled {
        let mut inner = self.lock();
        if inner.torn_down {
            let teardown = match created {
                Some(allocation) => Teardown {
                    vm: Some(allocation.vm),
                    running: false,
                    remove_disks: allocation.created_disks,
                    _claim: Some(allocation.claim),
                    _permit: ticket.permit,
                },
                None => Teardown {
                    vm: None,
                    running: false,
                    remove_disks: Vec::new(),
                    _claim: None,
                    _permit: ticket.permit,
                },
            };
            return Settled::TornDown(teardown);
        }

        let event = match created {
            Some(allocation) => {
                inner.vm = Some(allocation.vm);
                inner.config = Some(allocation.config);
                inner.claim = Some(allocation.claim);
                Event::CreateSucceeded
            }
            None => Event::CreateFailed,
        };
        self.commit(&mut inner, ticket, event)
    }

    /// Commit the outcome of a start or stop.
    pub(crate) fn settle(&self, ticket: Ticket, succeeded: bool) -> Settled {
        let mut inner = self.lock();
        if inner.torn_down {
            // The guest is up after a successful start or a failed stop.
            let running = matches!(
                (ticket.kind, succeeded),
                (OperationKind::Start, true) | (OperationKind::Stop, false)
            );
            return Settled::TornDown(Teardown {
                vm: inner.vm.take(),
                running,
                remove_disks: Vec::new(),
                _claim: inner.claim.take(),
                _permit: ticket.permit,
            });
        }

        let event = match (ticket.kind, succeeded) {
            (OperationKind::Start, true) => Event::StartSucceeded,
            (OperationKind::Start, false) => Event::StartFailed,
            (OperationKind::Stop, true) => Event::StopSucceeded,
            _ => Event::StopFailed,
        };
        self.commit(&mut inner, ticket, event)
    }

    fn commit(&self, inner: &mut Inner, ticket: Ticket, event: Event) -> Settled {
        let state = match self.apply(event) {
            Ok(state) => state,
            Err(state) => {
                // Only reachable if the token discipline is broken.
                tracing::error!(
                    handle = %self.handle,
                    ?event,
                    %state,
                    "Illegal transition ignored"
                );
                state
            }
        };
        inner.outstanding = None;
        drop(ticket.permit);
        Settled::Committed(state)
    }

    /// Mark the instance destroyed.
    ///
    /// Returns the teardown to run now, or `None` if an outstanding
    /// operation will run it when it settles (or it already ran).
    pub(crate) fn mark_torn_down(&self) -> Option<Teardown> {
        let mut inner = self.lock();
        if inner.torn_down {
            return None;
        }
        inner.torn_down = true;

        match Arc::clone(&self.token).try_acquire_owned() {
            Ok(permit) => Some(Teardown {
                vm: inner.vm.take(),
                running: self.state() == LifecycleState::Running,
                remove_disks: Vec::new(),
                _claim: inner.claim.take(),
                _permit: permit,
            }),
            Err(_) => {
                tracing::debug!(
                    handle = %self.handle,
                    outstanding = ?inner.outstanding,
                    "Teardown deferred to outstanding operation"
                );
                None
            }
        }
    }

    pub(crate) fn is_torn_down(&self) -> bool {
        self.lock().torn_down
    }

    /// The engine object for a vsock connect, if the guest is running.
    pub(crate) fn vm_for_connect(&self) -> Result<Arc<dyn EngineVm>> {
        let inner = self.lock();
        if inner.torn_down {
            return Err(BridgeError::UnknownHandle(self.handle));
        }

        let state = self.state();
        match (&inner.vm, state) {
            (Some(vm), LifecycleState::Running) => Ok(Arc::clone(vm)),
            _ => Err(BridgeError::InvalidState {
                operation: OperationKind::VsockConnect,
                state,
            }),
        }
    }
}
