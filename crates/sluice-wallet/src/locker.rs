//! Lock state of the wallet's key material.
//!
//! A single tokio task owns the state and serves requests over a channel.
//! Signing takes a [`HoldGuard`] first: while any guard is alive the wallet
//! cannot lock, and an auto-lock or explicit lock that comes due in the
//! meantime takes effect when the last guard drops.

use std::future::pending;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep_until};
use tracing::{debug, info};

use crate::error::WalletError;

enum Request {
    Unlock {
        passphrase: Vec<u8>,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<(), WalletError>>,
    },
    Lock,
    Hold { reply: oneshot::Sender<Result<(), WalletError>> },
    Release,
    IsLocked { reply: oneshot::Sender<bool> },
}

struct LockerState {
    passphrase_hash: blake3::Hash,
    unlocked: bool,
    /// When to lock. `None` while locked or unlocked without timeout.
    deadline: Option<Instant>,
    holds: usize,
}

impl LockerState {
    fn handle(&mut self, request: Request) {
        match request {
            Request::Unlock { passphrase, timeout, reply } => {
                let result = if blake3::hash(&passphrase) == self.passphrase_hash {
                    self.unlocked = true;
                    self.deadline = timeout.map(|t| Instant::now() + t);
                    info!(timeout_secs = timeout.map(|t| t.as_secs()), "wallet unlocked");
                    Ok(())
                } else {
                    Err(WalletError::InvalidPassphrase)
                };
                let _ = reply.send(result);
            }
            Request::Lock => {
                if self.holds == 0 {
                    self.lock();
                } else if self.unlocked {
                    debug!(holds = self.holds, "lock deferred until holds are released");
                    self.deadline = Some(Instant::now());
                }
            }
            Request::Hold { reply } => {
                let result = if self.unlocked {
                    self.holds += 1;
                    Ok(())
                } else {
                    Err(WalletError::Locked)
                };
                let _ = reply.send(result);
            }
            Request::Release => {
                self.holds = self.holds.saturating_sub(1);
                if self.holds == 0 && self.deadline.is_some_and(|d| d <= Instant::now()) {
                    self.lock();
                }
            }
            Request::IsLocked { reply } => {
                let _ = reply.send(!self.unlocked);
            }
        }
    }

    fn lock(&mut self) {
        if self.unlocked {
            info!("wallet locked");
        }
        self.unlocked = false;
        self.deadline = None;
    }

    /// Deadline the task should wake for, if one applies now.
    fn armed_deadline(&self) -> Option<Instant> {
        if self.unlocked && self.holds == 0 { self.deadline } else { None }
    }
}

async fn locker_loop(mut state: LockerState, mut requests: mpsc::UnboundedReceiver<Request>) {
    loop {
        let deadline = state.armed_deadline();
        let timer = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => pending::<()>().await,
            }
        };
        tokio::select! {
            request = requests.recv() => match request {
                Some(request) => state.handle(request),
                None => break,
            },
            _ = timer => {
                debug!("unlock timeout elapsed");
                state.lock();
            }
        }
    }
    debug!("key locker stopped");
}

/// Handle to the locker task. Cheap to clone.
#[derive(Clone)]
pub struct KeyLocker {
    requests: mpsc::UnboundedSender<Request>,
}

impl KeyLocker {
    /// Start the locker task, initially locked. Must be called within a
    /// tokio runtime. The task ends when every handle is dropped.
    pub fn spawn(passphrase: &[u8]) -> (Self, JoinHandle<()>) {
        let (requests, rx) = mpsc::unbounded_channel();
        let state = LockerState {
            passphrase_hash: blake3::hash(passphrase),
            unlocked: false,
            deadline: None,
            holds: 0,
        };
        let handle = tokio::spawn(locker_loop(state, rx));
        (Self { requests }, handle)
    }

    fn send(&self, request: Request) -> Result<(), WalletError> {
        self.requests.send(request).map_err(|_| WalletError::ShuttingDown)
    }

    /// Unlock for `timeout`, or until [`lock`](Self::lock) when `None`.
    pub async fn unlock(&self, passphrase: &[u8], timeout: Option<Duration>) -> Result<(), WalletError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Unlock { passphrase: passphrase.to_vec(), timeout, reply })?;
        rx.await.map_err(|_| WalletError::ShuttingDown)?
    }

    /// Lock now, or as soon as outstanding holds are released.
    pub fn lock(&self) -> Result<(), WalletError> {
        self.send(Request::Lock)
    }

    pub async fn is_locked(&self) -> Result<bool, WalletError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::IsLocked { reply })?;
        rx.await.map_err(|_| WalletError::ShuttingDown)
    }

    /// Keep the wallet unlocked until the guard drops.
    pub async fn hold(&self) -> Result<HoldGuard, WalletError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Hold { reply })?;
        rx.await.map_err(|_| WalletError::ShuttingDown)??;
        Ok(HoldGuard { requests: self.requests.clone() })
    }

    /// [`hold`](Self::hold) for threads outside the runtime.
    pub fn hold_blocking(&self) -> Result<HoldGuard, WalletError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Hold { reply })?;
        rx.blocking_recv().map_err(|_| WalletError::ShuttingDown)??;
        Ok(HoldGuard { requests: self.requests.clone() })
    }
}

/// Keeps the wallet unlocked while alive.
pub struct HoldGuard {
    requests: mpsc::UnboundedSender<Request>,
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Release);
    }
}
