//! Leaderless rendezvous between the workers of a pool.
//!
//! Every worker owns one [`Gate`] holding a sender to each peer and its own
//! inbox; nothing is shared. Any worker may close the gate with
//! [`Gate::request_close`]; once every still-registered worker has requested
//! within the current epoch, all of them exchange a contribution, compute the
//! same aggregate from it and reopen the gate for the next epoch.
//!
//! A worker that disappears without calling [`Gate::checkout`] blocks its
//! peers forever: the gate has no timeout.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::WorkerContext;
use crate::error::SimError;

/// Reason for closing the gate. `Stop` wins over `Sync` when both are asked
/// for in the same epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateRequest {
    Sync,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    Open,
    Closed,
    /// Every worker, this one included, has checked out.
    Finished,
}

enum Envelope<T> {
    Request {
        epoch: u64,
        from: usize,
        request: GateRequest,
    },
    Contribution {
        epoch: u64,
        from: usize,
        payload: T,
    },
    Checkout {
        from: usize,
    },
}

/// Outcome of one opening of the gate, identical on every participant.
#[derive(Clone, Debug, PartialEq)]
pub struct Rendezvous<R> {
    pub epoch: u64,
    pub requests: BTreeSet<GateRequest>,
    pub participants: Vec<usize>,
    pub aggregate: R,
}

impl<R> Rendezvous<R> {
    pub fn stop(&self) -> bool {
        self.requests.contains(&GateRequest::Stop)
    }
}

pub struct Gate<T> {
    context: WorkerContext,
    peers: Vec<Sender<Envelope<T>>>,
    inbox: Receiver<Envelope<T>>,
    epoch: u64,
    active: BTreeSet<usize>,
    sent: Option<GateRequest>,
    requests: BTreeMap<u64, BTreeMap<usize, GateRequest>>,
    contributions: BTreeMap<u64, BTreeMap<usize, T>>,
    checked_out: bool,
}

impl<T: Clone + Send> Gate<T> {
    /// One connected gate per rank, to be moved into the worker threads.
    pub fn pool(size: usize) -> Vec<Gate<T>> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| mpsc::channel()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| Gate {
                context: WorkerContext { rank, size },
                peers: senders.clone(),
                inbox,
                epoch: 0,
                active: (0..size).collect(),
                sent: None,
                requests: BTreeMap::new(),
                contributions: BTreeMap::new(),
                checked_out: false,
            })
            .collect()
    }

    pub fn context(&self) -> WorkerContext {
        self.context
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Workers still registered, as far as this worker knows.
    pub fn active(&self) -> &BTreeSet<usize> {
        &self.active
    }

    fn broadcast(&self, make: impl Fn() -> Envelope<T>) {
        for &rank in &self.active {
            // a peer that already left has dropped its inbox
            let _ = self.peers[rank].send(make());
        }
    }

    /// Sends to every rank the pool started with, including the ones this
    /// worker already saw leave: they still wait for everybody's checkout.
    fn broadcast_all(&self, make: impl Fn() -> Envelope<T>) {
        for peer in &self.peers {
            let _ = peer.send(make());
        }
    }

    fn absorb(&mut self, envelope: Envelope<T>) {
        match envelope {
            Envelope::Request { epoch, from, request } => {
                if epoch < self.epoch {
                    debug!(
                        "worker {}: stale request from {from} for epoch {epoch}",
                        self.context.rank
                    );
                    return;
                }
                let slot = self.requests.entry(epoch).or_default().entry(from).or_insert(request);
                *slot = (*slot).max(request);
            }
            Envelope::Contribution { epoch, from, payload } => {
                self.contributions.entry(epoch).or_default().insert(from, payload);
            }
            Envelope::Checkout { from } => {
                self.active.remove(&from);
                debug!("worker {}: worker {from} checked out", self.context.rank);
            }
        }
    }

    fn drain(&mut self) {
        loop {
            match self.inbox.try_recv() {
                Ok(envelope) => self.absorb(envelope),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn receive(&mut self) -> Result<(), SimError> {
        let envelope = self.inbox.recv().map_err(|_| SimError::GateDisconnected)?;
        self.absorb(envelope);
        Ok(())
    }

    /// Asks every worker to rendezvous. A second request in the same epoch
    /// is only sent when it upgrades `Sync` to `Stop`.
    pub fn request_close(&mut self, request: GateRequest) {
        if self.checked_out {
            return;
        }
        if self.sent.is_some_and(|sent| sent >= request) {
            return;
        }
        self.sent = Some(request);
        let (epoch, from) = (self.epoch, self.context.rank);
        debug!("worker {from}: requesting {request:?} for epoch {epoch}");
        self.broadcast(|| Envelope::Request { epoch, from, request });
    }

    /// True once any worker has requested a rendezvous for the current epoch.
    pub fn is_closed(&mut self) -> bool {
        self.drain();
        self.requests
            .get(&self.epoch)
            .is_some_and(|requests| !requests.is_empty())
    }

    pub fn state(&mut self) -> GateState {
        if self.checked_out {
            self.drain();
            if self.active.is_empty() {
                return GateState::Finished;
            }
        }
        if self.is_closed() {
            GateState::Closed
        } else {
            GateState::Open
        }
    }

    fn all_requested(&self) -> bool {
        let requested = self.requests.get(&self.epoch);
        self.active
            .iter()
            .all(|rank| requested.is_some_and(|requests| requests.contains_key(rank)))
    }

    fn all_contributed(&self) -> bool {
        let contributed = self.contributions.get(&self.epoch);
        self.active
            .iter()
            .all(|rank| contributed.is_some_and(|payloads| payloads.contains_key(rank)))
    }

    /// Blocks until every registered worker has requested in this epoch,
    /// exchanges `contribution`, and reopens the gate. A worker that has not
    /// requested yet joins with `Sync`.
    ///
    /// `aggregate` sees the contributions ordered by rank, so every
    /// participant computes the same value.
    pub fn wait_until_open<R>(
        &mut self,
        contribution: T,
        aggregate: impl FnOnce(&[(usize, T)]) -> R,
    ) -> Result<Rendezvous<R>, SimError> {
        if self.checked_out {
            return Err(SimError::invalid(format!(
                "worker {} waits on a gate it has left",
                self.context.rank
            )));
        }
        if self.sent.is_none() {
            self.request_close(GateRequest::Sync);
        }
        while !self.all_requested() {
            self.receive()?;
        }

        let (epoch, from) = (self.epoch, self.context.rank);
        self.broadcast(|| Envelope::Contribution {
            epoch,
            from,
            payload: contribution.clone(),
        });
        while !self.all_contributed() {
            self.receive()?;
        }

        let requests: BTreeSet<GateRequest> = self
            .requests
            .remove(&epoch)
            .map(|requests| requests.into_values().collect())
            .unwrap_or_default();
        let payloads: Vec<(usize, T)> = self
            .contributions
            .remove(&epoch)
            .map(|payloads| payloads.into_iter().collect())
            .unwrap_or_default();
        let participants: Vec<usize> = payloads.iter().map(|(rank, _)| *rank).collect();
        self.epoch += 1;
        self.sent = None;
        info!(
            "worker {}: gate epoch {epoch} opened with {} participants ({:?})",
            self.context.rank,
            participants.len(),
            requests
        );
        Ok(Rendezvous {
            epoch,
            requests,
            participants,
            aggregate: aggregate(&payloads),
        })
    }

    /// Joins the rendezvous if the gate is closed, otherwise returns at once.
    pub fn checkpoint<R>(
        &mut self,
        contribution: impl FnOnce() -> T,
        aggregate: impl FnOnce(&[(usize, T)]) -> R,
    ) -> Result<Option<Rendezvous<R>>, SimError> {
        if self.checked_out || !self.is_closed() {
            return Ok(None);
        }
        self.wait_until_open(contribution(), aggregate).map(Some)
    }

    /// Leaves the pool for good; peers stop waiting for this worker.
    pub fn checkout(&mut self) {
        if self.checked_out {
            return;
        }
        let from = self.context.rank;
        self.broadcast_all(|| Envelope::Checkout { from });
        self.checked_out = true;
        info!("worker {from}: checked out of the gate");
    }

    /// Blocks until every worker has checked out. Requires a prior
    /// [`Gate::checkout`].
    pub fn wait_finished(&mut self) -> Result<(), SimError> {
        if !self.checked_out {
            return Err(SimError::invalid(format!(
                "worker {} waits for the pool without checking out",
                self.context.rank
            )));
        }
        while !self.active.is_empty() {
            self.receive()?;
        }
        Ok(())
    }
}
