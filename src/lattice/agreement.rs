//! One-shot lattice agreement over best-effort broadcast.
//!
//! Guarantees, per agreement number:
//! 1. Validity - a decided set contains the local input and stays within the
//!    union of all inputs
//! 2. Consistency - any two decided sets are comparable by inclusion
//! 3. Termination - every correct process decides in a bounded number of
//!    proposal rounds

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::broadcast::best_effort::BestEffortBroadcast;
use crate::core::gate::SendGate;
use crate::core::id::ProcessId;
use crate::core::membership::Membership;
use crate::lattice::message::{self, LatticeMessage, MessageKind};
use crate::network::link::LinkError;

/// Proposals this node may have outstanding at once. One keeps the per-
/// agreement state machines strictly sequential.
pub const MAX_IN_FLIGHT: usize = 1;

type DecisionCallback = Box<dyn FnMut(&HashSet<u32>) + Send>;

/// Proposer and acceptor state for one agreement number.
///
/// `proposed_value` only grows within an agreement; `accepted_value` is a
/// superset of every set this node has ever acked. Once `has_decided` is set
/// the proposer side is frozen and late acks/nacks are dropped; the acceptor
/// side keeps answering so slower peers still make progress.
#[derive(Default)]
struct Agreement {
    ack_count: u32,
    nack_count: u32,
    proposed_value: HashSet<u32>,
    accepted_value: HashSet<u32>,
    proposal_nr: u32,
    has_decided: bool,
}

/// Work to do after the agreements lock is dropped. Outbound sends and the
/// decision callback both happen lock-free.
enum Outcome {
    Nothing,
    Broadcast(Vec<u8>),
    Decide(HashSet<u32>),
}

pub struct LatticeAgreement {
    beb: BestEffortBroadcast,
    agreements: Mutex<HashMap<u32, Agreement>>,
    next_agreement_nr: AtomicU32,
    gate: SendGate,
    /// Size of the value universe; a proposal that reaches it cannot grow
    /// and is decided on the spot.
    unique_proposals: usize,
    on_decide: Mutex<DecisionCallback>,
}

impl LatticeAgreement {
    /// `unique_proposals` bounds the number of distinct values across all
    /// inputs. `on_decide` fires once per agreement, in agreement order,
    /// with the decided set.
    pub fn new<F>(
        id: ProcessId,
        membership: Membership,
        unique_proposals: usize,
        on_decide: F,
    ) -> Self
    where
        F: FnMut(&HashSet<u32>) + Send + 'static,
    {
        Self {
            beb: BestEffortBroadcast::new(id, membership),
            agreements: Mutex::new(HashMap::new()),
            next_agreement_nr: AtomicU32::new(0),
            gate: SendGate::new(MAX_IN_FLIGHT),
            unique_proposals,
            on_decide: Mutex::new(Box::new(on_decide)),
        }
    }

    #[inline]
    pub fn id(&self) -> ProcessId {
        self.beb.id()
    }

    pub async fn bind(&self, addr: SocketAddr) -> Result<(), LinkError> {
        self.beb.bind(addr).await
    }

    /// Starts the next agreement with `values` as the local input. Blocks
    /// while a previous proposal is still undecided.
    pub async fn propose(&self, values: &[u32]) -> Result<(), LinkError> {
        self.gate.acquire().await;
        let agreement_nr = self.next_agreement_nr.fetch_add(1, Ordering::Relaxed);

        let outcome = {
            let mut agreements = self.agreements.lock();
            let agreement = agreements.entry(agreement_nr).or_default();
            agreement.proposed_value.extend(values.iter().copied());

            if agreement.proposed_value.len() >= self.unique_proposals {
                // The set already spans the whole universe; no round needed.
                Outcome::Decide(self.decide(agreement))
            } else {
                Outcome::Broadcast(self.encode_proposal(agreement_nr, agreement))
            }
        };

        let result = self.apply(outcome);
        if result.is_err() {
            // An unsendable proposal must not wedge later agreements.
            self.gate.release();
        }
        result
    }

    /// Owns the receive loop, dispatching proposals, acks, and nacks until
    /// shutdown. Decisions fire on the callback given at construction.
    pub async fn listen(&self) -> Result<(), LinkError> {
        self.beb
            .listen_batch(|sender, _metadata, payloads| {
                for payload in payloads {
                    self.handle_message(sender, payload);
                }
            })
            .await
    }

    pub fn shutdown(&self) {
        self.beb.shutdown();
    }

    fn handle_message(&self, sender: ProcessId, payload: &[u8]) {
        let Some(msg) = message::decode(payload) else {
            warn!(sender, "dropping malformed agreement message");
            return;
        };
        match msg.kind {
            MessageKind::Proposal => self.handle_proposal(sender, msg),
            MessageKind::Ack => self.handle_ack(msg),
            MessageKind::Nack => self.handle_nack(msg),
        }
    }

    /// Acceptor side: ack when the proposer's set covers everything we have
    /// accepted, otherwise nack with what it is missing. Runs even for
    /// agreements we have already decided ourselves.
    fn handle_proposal(&self, sender: ProcessId, msg: LatticeMessage) {
        let incoming: HashSet<u32> = msg.values.iter().copied().collect();

        let reply = {
            let mut agreements = self.agreements.lock();
            let agreement = agreements.entry(msg.agreement_nr).or_default();

            let difference: Vec<u32> = agreement
                .accepted_value
                .iter()
                .copied()
                .filter(|v| !incoming.contains(v))
                .collect();
            agreement.accepted_value.extend(incoming.iter().copied());

            if difference.is_empty() {
                message::encode(
                    MessageKind::Ack,
                    msg.agreement_nr,
                    msg.proposal_nr,
                    std::iter::empty(),
                )
            } else {
                message::encode(
                    MessageKind::Nack,
                    msg.agreement_nr,
                    msg.proposal_nr,
                    difference.iter().copied(),
                )
            }
        };

        let Some(addr) = self.beb.membership().addr_of(sender) else {
            warn!(sender, "proposal from unknown process");
            return;
        };
        if let Err(error) = self.beb.send(addr, &[], &[&reply]) {
            warn!(sender, %error, "failed to answer proposal");
        }
    }

    fn handle_ack(&self, msg: LatticeMessage) {
        let outcome = {
            let mut agreements = self.agreements.lock();
            let agreement = agreements.entry(msg.agreement_nr).or_default();
            if agreement.has_decided || msg.proposal_nr != agreement.proposal_nr {
                debug!(agreement_nr = msg.agreement_nr, "dropping stale ack");
                return;
            }

            agreement.ack_count += 1;
            if 2 * agreement.ack_count as usize >= self.group_size() {
                Outcome::Decide(self.decide(agreement))
            } else {
                self.check_nacks(msg.agreement_nr, agreement)
            }
        };

        if let Err(error) = self.apply(outcome) {
            warn!(%error, "failed to act on ack");
        }
    }

    fn handle_nack(&self, msg: LatticeMessage) {
        let outcome = {
            let mut agreements = self.agreements.lock();
            let agreement = agreements.entry(msg.agreement_nr).or_default();
            if agreement.has_decided || msg.proposal_nr != agreement.proposal_nr {
                debug!(agreement_nr = msg.agreement_nr, "dropping stale nack");
                return;
            }

            agreement.proposed_value.extend(msg.values.iter().copied());
            agreement.nack_count += 1;

            if agreement.proposed_value.len() >= self.unique_proposals {
                // Nothing outside the set is left to learn.
                Outcome::Decide(self.decide(agreement))
            } else {
                self.check_nacks(msg.agreement_nr, agreement)
            }
        };

        if let Err(error) = self.apply(outcome) {
            warn!(%error, "failed to act on nack");
        }
    }

    /// Once a quorum has answered but some answers were nacks, this round
    /// cannot reach a majority of acks any more: move to the next round with
    /// the enlarged set. Stale answers are fenced by the bumped proposal_nr.
    fn check_nacks(&self, agreement_nr: u32, agreement: &mut Agreement) -> Outcome {
        let answers = (agreement.ack_count + agreement.nack_count) as usize;
        if 2 * answers >= self.group_size() {
            agreement.proposal_nr += 1;
            agreement.ack_count = 0;
            agreement.nack_count = 0;
            Outcome::Broadcast(self.encode_proposal(agreement_nr, agreement))
        } else {
            Outcome::Nothing
        }
    }

    /// Latches the decision and returns the set to hand to the callback.
    fn decide(&self, agreement: &mut Agreement) -> HashSet<u32> {
        agreement.has_decided = true;
        if agreement.proposed_value.len() >= self.unique_proposals {
            // A full-universe decision lets us ack any future proposal for
            // this agreement with the complete set.
            agreement
                .accepted_value
                .extend(agreement.proposed_value.iter().copied());
        }
        agreement.proposed_value.clone()
    }

    fn encode_proposal(&self, agreement_nr: u32, agreement: &Agreement) -> Vec<u8> {
        message::encode(
            MessageKind::Proposal,
            agreement_nr,
            agreement.proposal_nr,
            agreement.proposed_value.iter().copied(),
        )
    }

    fn apply(&self, outcome: Outcome) -> Result<(), LinkError> {
        match outcome {
            Outcome::Nothing => Ok(()),
            Outcome::Broadcast(proposal) => self.beb.broadcast(&[], &[&proposal]),
            Outcome::Decide(decision) => {
                {
                    let mut on_decide = self.on_decide.lock();
                    (*on_decide)(&decision);
                }
                self.gate.release();
                Ok(())
            }
        }
    }

    #[inline]
    fn group_size(&self) -> usize {
        self.beb.membership().len()
    }
}
