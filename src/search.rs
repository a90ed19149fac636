//! Iterative closest-peer lookup.
//!
//! A search starts from seed peers drawn from the routing table and walks the
//! network toward the target: up to `concurrency` workers repeatedly take the
//! closest unqueried candidate, issue a Find query, and merge the referrals
//! back into the candidate set. Candidates are dequeued in distance order, so
//! once the closest responders stop improving the lookup has converged.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::debug;

use crate::config::SearchConfig;
use crate::core::id::{Distance, Id};
use crate::core::peer::PeerAddress;
use crate::core::storage::Document;
use crate::error::{Error, QueryError};
use crate::rpc::Client;

/// What a search is after: the closest peers themselves, or a value one of
/// them may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Peers,
    Value,
}

/// An unqueried peer, ordered so that a `BinaryHeap` pops the closest first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    distance: Distance,
    address: PeerAddress,
}

impl Candidate {
    fn new(target: &Id, address: PeerAddress) -> Self {
        Self {
            distance: address.peer_id.distance(target),
            address,
        }
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: the heap's max is the smallest distance
        other
            .distance
            .cmp(&self.distance)
            .then_with(|| other.address.peer_id.cmp(&self.address.peer_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    /// Value mode only: a responder returned the value.
    Found,
    /// The error budget was exceeded.
    Errored,
    /// No unqueried candidates remain and nothing is in flight.
    Exhausted,
    /// The closest responders can no longer improve.
    Converged,
}

enum Step {
    Query(PeerAddress),
    Wait,
    Done,
}

/// Shared per-lookup state; every access is under the lookup mutex and brief.
struct LookupState {
    target: Id,
    mode: Mode,
    local_id: Id,
    n_closest: usize,
    max_errors: usize,
    unqueried: BinaryHeap<Candidate>,
    /// Every peer ever entered into the lookup, queried or not.
    seen: HashSet<Id>,
    queried: HashSet<Id>,
    in_flight: usize,
    /// Successful responders, ascending by distance to the target.
    responded: Vec<Candidate>,
    errors: Vec<QueryError>,
    value: Option<Document>,
    finished: Option<Termination>,
}

impl LookupState {
    fn new(
        target: Id,
        mode: Mode,
        local_id: Id,
        config: &SearchConfig,
        seeds: Vec<PeerAddress>,
    ) -> Self {
        let mut state = Self {
            target,
            mode,
            local_id,
            n_closest: config.n_closest_responses,
            max_errors: config.n_max_errors,
            unqueried: BinaryHeap::new(),
            seen: HashSet::new(),
            queried: HashSet::new(),
            in_flight: 0,
            responded: Vec::new(),
            errors: Vec::new(),
            value: None,
            finished: None,
        };
        for seed in seeds {
            state.offer(seed);
        }
        state
    }

    /// Enter a peer into the candidate set unless it is us or already known.
    fn offer(&mut self, address: PeerAddress) {
        if address.peer_id == self.local_id {
            return;
        }
        if self.seen.insert(address.peer_id) {
            self.unqueried.push(Candidate::new(&self.target, address));
        }
    }

    /// Evaluate the termination conditions, in order.
    fn evaluate(&mut self) {
        if self.finished.is_some() {
            return;
        }
        if self.value.is_some() {
            self.finished = Some(Termination::Found);
        } else if self.errors.len() >= self.max_errors {
            self.finished = Some(Termination::Errored);
        } else if self.unqueried.is_empty() && self.in_flight == 0 {
            self.finished = Some(Termination::Exhausted);
        } else if self.responded.len() >= self.n_closest {
            // converged once no waiting candidate beats the farthest of the
            // k closest responders
            let farthest = self.responded[self.n_closest - 1].distance;
            let closer_waiting = self
                .unqueried
                .peek()
                .map(|c| c.distance < farthest)
                .unwrap_or(false);
            if !closer_waiting {
                self.finished = Some(Termination::Converged);
            }
        }
    }

    fn next(&mut self) -> Step {
        self.evaluate();
        if self.finished.is_some() {
            return Step::Done;
        }
        match self.unqueried.pop() {
            Some(candidate) => {
                self.queried.insert(candidate.address.peer_id);
                self.in_flight += 1;
                Step::Query(candidate.address)
            }
            // evaluate() would have declared exhaustion if nothing were in
            // flight, so there are responses still coming that may refer new
            // candidates
            None => Step::Wait,
        }
    }

    fn record_response(
        &mut self,
        responder: &PeerAddress,
        referrals: Vec<PeerAddress>,
        value: Option<Document>,
    ) {
        self.in_flight -= 1;
        if self.finished.is_some() {
            // late arrival after termination; the result stands as-is
            return;
        }
        for referral in referrals {
            self.offer(referral);
        }
        let candidate = Candidate::new(&self.target, responder.clone());
        let pos = self
            .responded
            .partition_point(|c| c.distance <= candidate.distance);
        self.responded.insert(pos, candidate);
        if self.mode == Mode::Value && self.value.is_none() {
            self.value = value;
        }
        self.evaluate();
    }

    fn record_error(&mut self, error: QueryError) {
        self.in_flight -= 1;
        if self.finished.is_some() {
            return;
        }
        self.errors.push(error);
        self.evaluate();
    }

    fn closest(&self) -> Vec<PeerAddress> {
        self.responded
            .iter()
            .take(self.n_closest)
            .map(|c| c.address.clone())
            .collect()
    }
}

/// Everything a search produced. `closest` holds the k closest responders in
/// ascending distance order; `value` is set when a Value search succeeded.
#[derive(Debug)]
pub struct SearchOutcome {
    pub closest: Vec<PeerAddress>,
    pub value: Option<Document>,
    /// The lookup ran out of candidates before it could converge; the result
    /// is best-effort.
    pub exhausted: bool,
    pub errors: Vec<QueryError>,
}

/// Runs iterative lookups against the network through the client shim.
#[derive(Clone)]
pub struct Searcher {
    client: Client,
    config: SearchConfig,
}

impl Searcher {
    pub fn new(client: Client, config: SearchConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Run a lookup for `target` starting from `seeds`.
    ///
    /// Returns `Err(LookupErrored)` when the error budget is exceeded or the
    /// lookup deadline passes; otherwise the outcome carries the closest
    /// responders (and the value, if one was found in Value mode).
    pub async fn run(
        &self,
        target: Id,
        mode: Mode,
        seeds: Vec<PeerAddress>,
    ) -> Result<SearchOutcome, Error> {
        let state = Arc::new(Mutex::new(LookupState::new(
            target,
            mode,
            self.client.peer_id(),
            &self.config,
            seeds,
        )));
        let notify = Arc::new(Notify::new());

        let mut workers = JoinSet::new();
        for _ in 0..self.config.concurrency.max(1) {
            workers.spawn(worker(
                Arc::clone(&state),
                Arc::clone(&notify),
                self.client.clone(),
                self.config.clone(),
                target,
            ));
        }

        if let Some(deadline) = self.config.deadline {
            let all_done = timeout(deadline, async {
                while workers.join_next().await.is_some() {}
            })
            .await
            .is_ok();
            if !all_done {
                // cancel outstanding queries; anything they would have
                // reported is discarded with them
                workers.shutdown().await;
                let errors = state.lock().await.errors.len();
                debug!(target = %target.short_hex(), "lookup deadline passed");
                return Err(Error::LookupErrored { errors });
            }
        } else {
            while workers.join_next().await.is_some() {}
        }

        let mut state = state.lock().await;
        match state.finished {
            Some(Termination::Errored) => Err(Error::LookupErrored {
                errors: state.errors.len(),
            }),
            Some(Termination::Found)
            | Some(Termination::Converged)
            | Some(Termination::Exhausted) => Ok(SearchOutcome {
                closest: state.closest(),
                value: state.value.take(),
                exhausted: state.finished == Some(Termination::Exhausted),
                errors: std::mem::take(&mut state.errors),
            }),
            None => Err(Error::Fatal("lookup workers exited unfinished".into())),
        }
    }
}

async fn worker(
    state: Arc<Mutex<LookupState>>,
    notify: Arc<Notify>,
    client: Client,
    config: SearchConfig,
    target: Id,
) {
    let num_peers = config.n_closest_responses as u32;
    loop {
        // register for wakeups before inspecting state, so a notification
        // between the check and the await is not lost
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let step = { state.lock().await.next() };
        let address = match step {
            Step::Done => {
                notify.notify_waiters();
                return;
            }
            Step::Wait => {
                notified.await;
                continue;
            }
            Step::Query(address) => address,
        };

        debug!(
            peer = %address.peer_id.short_hex(),
            target = %target.short_hex(),
            "querying"
        );
        let result = timeout(
            config.query_timeout,
            client.find(&address, target, num_peers),
        )
        .await;

        {
            let mut state = state.lock().await;
            match result {
                Ok(Ok(found)) => state.record_response(&address, found.peers, found.value),
                Ok(Err(error)) => {
                    debug!(peer = %address.peer_id.short_hex(), %error, "query failed");
                    state.record_error(error);
                }
                Err(_elapsed) => {
                    debug!(peer = %address.peer_id.short_hex(), "query timed out");
                    state.record_error(QueryError::Timeout);
                }
            }
        }
        notify.notify_waiters();
    }
}
