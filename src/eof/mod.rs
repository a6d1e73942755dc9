//! EOF coordination among the replicas of a stage.
//!
//! A stage knows its input for a client has ended once its replicas have collectively received
//! as many messages as the upstream stages reported sending. That is established by a token
//! circulating the ring of replicas through their control queues:
//!
//! - An `EofFirst` is funnelled to replica 0, which turns it into an `EofRequeue` token carrying
//!   the number of messages still unaccounted for.
//! - Each replica holding the token subtracts the messages it received since it last held it and
//!   adds the messages it sent, then passes it on. Once every replica has been visited the token
//!   keeps circulating, with a backoff, until nothing is left unaccounted for.
//! - The drained stage then circulates an `EofFinish` token, on which every replica flushes its
//!   processor. The last replica propagates EOF downstream with the reconciled sent total and
//!   broadcasts the completion notice, upon which every replica evicts the client.
//!
//! The coordinator is a pure state machine. It is fed envelopes along with the replica's current
//! counters for the client, and answers with the actions the replica has to take.

#[cfg(test)]
mod mod_test;

use std::collections::{HashMap, HashSet, VecDeque};

use crate::envelope::Envelope;

/// The number of most recently evicted clients a replica remembers, so that their stale tokens
/// and late messages are dropped.
pub const EVICTED_RETAINED: usize = 4096;

/// The EOF phase of a client on one replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EofPhase {
    /// No EOF seen yet.
    Active,
    /// An EOF token for the client is circulating.
    Draining,
    /// The stage finished the client.
    Done,
}

/// A replica's counters for a client at the time an EOF token is handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientCounts {
    /// Unique messages received from upstream.
    pub received: u64,
    /// Messages published downstream.
    pub sent: u64,
}

/// An action a replica has to take on behalf of the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EofAction {
    /// Deliver the envelope to the control queue of the given replica, which may be this one.
    Forward {
        to: u32,
        envelope: Envelope,
        /// Deliver only after the requeue backoff.
        delayed: bool,
    },
    /// Propagate EOF downstream with the stage's reconciled count of messages sent.
    SendDownstream { client_id: u32, messages_sent: u64 },
    /// Deliver the envelope to every replica of the stage.
    Broadcast { envelope: Envelope },
    /// Drop every trace of the client.
    Evict { client_id: u32 },
}

/// The per-client state of a coordinator.
#[derive(Clone, Debug)]
struct ClientEof {
    phase: EofPhase,
    /// Count of `EofFirst` envelopes seen, tracked on replica 0 only.
    firsts_seen: u32,
    /// Sum of the upstream counts of the `EofFirst` envelopes seen.
    firsts_total: u64,
    /// The part of the received counter already folded into a token.
    reported_received: u64,
    /// The part of the sent counter already folded into a token.
    reported_sent: u64,
    /// Whether this replica has flushed its processor for the client.
    finished: bool,
}

impl Default for ClientEof {
    fn default() -> Self {
        Self {
            phase: EofPhase::Active,
            firsts_seen: 0,
            firsts_total: 0,
            reported_received: 0,
            reported_sent: 0,
            finished: false,
        }
    }
}

/// The EOF coordinator of one stage replica.
pub struct EofCoordinator {
    /// The index of this replica in its stage.
    index: u32,
    /// The number of replicas of the stage.
    replicas: u32,
    /// The number of upstream `EofFirst` envelopes which end a client's input.
    eof_sources: u32,
    clients: HashMap<u32, ClientEof>,
    /// Clients which the stage has finished and evicted.
    evicted: HashSet<u32>,
    /// The evicted clients, oldest first.
    evicted_order: VecDeque<u32>,
}

impl EofCoordinator {
    /// Create a new instance.
    pub fn new(index: u32, replicas: u32, eof_sources: u32) -> Self {
        Self {
            index,
            replicas: replicas.max(1),
            eof_sources: eof_sources.max(1),
            clients: Default::default(),
            evicted: Default::default(),
            evicted_order: Default::default(),
        }
    }

    /// The phase of the given client on this replica.
    pub fn phase(&self, client_id: u32) -> EofPhase {
        if self.evicted.contains(&client_id) {
            return EofPhase::Done;
        }
        self.clients.get(&client_id).map(|state| state.phase).unwrap_or(EofPhase::Active)
    }

    /// Check if this replica still has to flush its processor for the client before handling
    /// the given envelope.
    pub fn should_flush(&self, envelope: &Envelope) -> bool {
        match envelope {
            Envelope::EofFinish { client_id, .. } => {
                !self.evicted.contains(client_id) && !self.clients.get(client_id).map(|state| state.finished).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Handle an EOF envelope given this replica's current counters for its client.
    pub fn handle(&mut self, envelope: Envelope, counts: ClientCounts) -> Vec<EofAction> {
        let client_id = envelope.client_id();
        if self.evicted.contains(&client_id) && !matches!(envelope, Envelope::EofCallbackSpecial { .. }) {
            tracing::debug!(client_id, replica = self.index, ?envelope, "ignoring EOF envelope of evicted client");
            return vec![];
        }
        match envelope {
            Envelope::Protocol { .. } => vec![],
            Envelope::EofFirst { client_id, messages_sent } => self.handle_first(client_id, messages_sent, counts),
            Envelope::EofRequeue {
                client_id,
                ttl,
                remaining,
                messages_sent,
                original_sender_sent,
            } => self.handle_requeue(client_id, ttl, remaining, messages_sent, original_sender_sent, counts),
            Envelope::EofFinish { client_id, ttl, messages_sent } => self.handle_finish(client_id, ttl, messages_sent, counts),
            Envelope::EofCallbackSpecial { client_id } => self.handle_callback(client_id),
        }
    }

    fn next_replica(&self) -> u32 {
        (self.index + 1) % self.replicas
    }

    fn handle_first(&mut self, client_id: u32, messages_sent: u64, counts: ClientCounts) -> Vec<EofAction> {
        if self.index != 0 {
            return vec![EofAction::Forward {
                to: 0,
                envelope: Envelope::EofFirst { client_id, messages_sent },
                delayed: false,
            }];
        }

        let eof_sources = self.eof_sources;
        let state = self.clients.entry(client_id).or_default();
        if state.phase != EofPhase::Active {
            tracing::warn!(client_id, phase = ?state.phase, "ignoring duplicate EofFirst for client already draining");
            return vec![];
        }
        state.firsts_seen += 1;
        state.firsts_total += messages_sent;
        if state.firsts_seen < eof_sources {
            tracing::debug!(client_id, seen = state.firsts_seen, eof_sources, "waiting on more upstream EOFs");
            return vec![];
        }
        state.phase = EofPhase::Draining;
        let total = state.firsts_total;
        tracing::debug!(client_id, total, replicas = self.replicas, "upstream EOF complete, starting drain");
        self.handle_requeue(client_id, self.replicas - 1, total, 0, total, counts)
    }

    fn handle_requeue(
        &mut self, client_id: u32, ttl: u32, remaining: u64, messages_sent: u64, original_sender_sent: u64, counts: ClientCounts,
    ) -> Vec<EofAction> {
        let index = self.index;
        let state = self.clients.entry(client_id).or_default();
        if state.phase == EofPhase::Done {
            tracing::debug!(client_id, "ignoring EOF requeue for finished client");
            return vec![];
        }
        state.phase = EofPhase::Draining;

        let received_delta = counts.received.saturating_sub(state.reported_received);
        if received_delta > remaining {
            tracing::warn!(
                client_id,
                replica = index,
                remaining,
                received_delta,
                original_sender_sent,
                "replica received more messages than upstream reported sending"
            );
        }
        let remaining = remaining.saturating_sub(received_delta);
        state.reported_received = state.reported_received.max(counts.received);
        let messages_sent = messages_sent + counts.sent.saturating_sub(state.reported_sent);
        state.reported_sent = state.reported_sent.max(counts.sent);

        let next = self.next_replica();
        if ttl > 0 {
            return vec![EofAction::Forward {
                to: next,
                envelope: Envelope::EofRequeue {
                    client_id,
                    ttl: ttl - 1,
                    remaining,
                    messages_sent,
                    original_sender_sent,
                },
                delayed: false,
            }];
        }
        if remaining == 0 {
            tracing::debug!(client_id, replica = index, messages_sent, "stage drained, starting finish round");
            return vec![EofAction::Forward {
                to: index,
                envelope: Envelope::EofFinish {
                    client_id,
                    ttl: self.replicas - 1,
                    messages_sent,
                },
                delayed: false,
            }];
        }
        tracing::trace!(client_id, replica = index, remaining, "stage not yet drained, requeuing EOF token");
        vec![EofAction::Forward {
            to: next,
            envelope: Envelope::EofRequeue {
                client_id,
                ttl: 0,
                remaining,
                messages_sent,
                original_sender_sent,
            },
            delayed: true,
        }]
    }

    /// Handle the finish token; the replica must already have flushed when `should_flush` said so.
    fn handle_finish(&mut self, client_id: u32, ttl: u32, messages_sent: u64, counts: ClientCounts) -> Vec<EofAction> {
        let next = self.next_replica();
        let state = self.clients.entry(client_id).or_default();
        if state.phase == EofPhase::Done {
            tracing::debug!(client_id, "ignoring EOF finish for finished client");
            return vec![];
        }
        state.phase = EofPhase::Draining;
        state.finished = true;
        let messages_sent = messages_sent + counts.sent.saturating_sub(state.reported_sent);
        state.reported_sent = state.reported_sent.max(counts.sent);

        if ttl > 0 {
            return vec![EofAction::Forward {
                to: next,
                envelope: Envelope::EofFinish {
                    client_id,
                    ttl: ttl - 1,
                    messages_sent,
                },
                delayed: false,
            }];
        }
        state.phase = EofPhase::Done;
        tracing::debug!(client_id, replica = self.index, messages_sent, "stage finished client");
        vec![
            EofAction::SendDownstream { client_id, messages_sent },
            EofAction::Broadcast {
                envelope: Envelope::EofCallbackSpecial { client_id },
            },
        ]
    }

    fn handle_callback(&mut self, client_id: u32) -> Vec<EofAction> {
        if !self.evicted.insert(client_id) {
            return vec![];
        }
        self.evicted_order.push_back(client_id);
        if self.evicted_order.len() > EVICTED_RETAINED {
            if let Some(oldest) = self.evicted_order.pop_front() {
                self.evicted.remove(&oldest);
            }
        }
        self.clients.remove(&client_id);
        vec![EofAction::Evict { client_id }]
    }
}
