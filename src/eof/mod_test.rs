use std::collections::VecDeque;

use anyhow::{bail, Result};
use rand::Rng;

use crate::envelope::Envelope;
use crate::eof::{ClientCounts, EofAction, EofCoordinator, EofPhase, EVICTED_RETAINED};

/// A simulated stage of replicas exchanging EOF tokens through per-replica control queues.
struct Stage {
    coordinators: Vec<EofCoordinator>,
    counts: Vec<ClientCounts>,
    control: Vec<VecDeque<Envelope>>,
    downstream: Vec<(u32, u64)>,
    evictions: Vec<u32>,
    flushes: Vec<u32>,
}

impl Stage {
    fn new(replicas: u32, eof_sources: u32) -> Self {
        Self {
            coordinators: (0..replicas).map(|idx| EofCoordinator::new(idx, replicas, eof_sources)).collect(),
            counts: vec![ClientCounts::default(); replicas as usize],
            control: vec![VecDeque::new(); replicas as usize],
            downstream: vec![],
            evictions: vec![],
            flushes: vec![],
        }
    }

    /// Deliver a data message to the given replica, which emits `outputs` records for it.
    fn deliver(&mut self, replica: usize, outputs: u64) {
        self.counts[replica].received += 1;
        self.counts[replica].sent += outputs;
    }

    /// Handle the next control envelope of the given replica, returning false if it had none.
    fn step(&mut self, replica: usize) -> bool {
        let envelope = match self.control[replica].pop_front() {
            Some(envelope) => envelope,
            None => return false,
        };
        if self.coordinators[replica].should_flush(&envelope) {
            // Replicas with an odd index emit one trailing record when flushed.
            self.flushes.push(replica as u32);
            self.counts[replica].sent += (replica % 2) as u64;
        }
        let actions = self.coordinators[replica].handle(envelope, self.counts[replica]);
        for action in actions {
            match action {
                EofAction::Forward { to, envelope, .. } => self.control[to as usize].push_back(envelope),
                EofAction::SendDownstream { client_id, messages_sent } => self.downstream.push((client_id, messages_sent)),
                EofAction::Broadcast { envelope } => {
                    for queue in self.control.iter_mut() {
                        queue.push_back(envelope.clone());
                    }
                }
                EofAction::Evict { client_id } => self.evictions.push(client_id),
            }
        }
        true
    }

    fn has_control(&self) -> bool {
        self.control.iter().any(|queue| !queue.is_empty())
    }

    fn total_sent(&self) -> u64 {
        self.counts.iter().map(|counts| counts.sent).sum()
    }
}

#[test]
fn three_replicas_drain_client_42() -> Result<()> {
    let mut stage = Stage::new(3, 1);
    // 30 messages spread 10/12/8 over the replicas, one output per message.
    for (replica, count) in [(0usize, 10), (1, 12), (2, 8)] {
        for _ in 0..count {
            stage.deliver(replica, 1);
        }
    }
    stage.control[1].push_back(Envelope::EofFirst { client_id: 42, messages_sent: 30 });

    let mut rounds = 0;
    while stage.has_control() {
        for replica in 0..3 {
            stage.step(replica);
        }
        rounds += 1;
        if rounds > 100 {
            bail!("EOF protocol did not converge");
        }
    }

    // Replica 1 flushes a trailing record.
    assert_eq!(stage.downstream, vec![(42, 31)], "expected one downstream EOF with 31 messages, got {:?}", stage.downstream);
    let mut flushes = stage.flushes.clone();
    flushes.sort_unstable();
    assert_eq!(flushes, vec![0, 1, 2], "expected every replica to flush exactly once, got {:?}", flushes);
    assert_eq!(stage.evictions, vec![42, 42, 42], "expected every replica to evict client 42");
    for (idx, coordinator) in stage.coordinators.iter().enumerate() {
        assert_eq!(coordinator.phase(42), EofPhase::Done, "expected replica {} to be done", idx);
    }
    Ok(())
}

#[test]
fn drain_converges_for_random_distributions() -> Result<()> {
    let mut rng = rand::thread_rng();
    for _ in 0..50 {
        let replicas = rng.gen_range(1..=6u32);
        let total = rng.gen_range(0..200u64);
        let mut stage = Stage::new(replicas, 1);

        // Deliver part of the messages before EOF arrives, and the rest while the token circulates.
        let mut undelivered: Vec<usize> = (0..total).map(|_| rng.gen_range(0..replicas as usize)).collect();
        let early = rng.gen_range(0..=undelivered.len());
        for replica in undelivered.drain(..early) {
            let outputs = rng.gen_range(0..3);
            stage.deliver(replica, outputs);
        }
        let entry = rng.gen_range(0..replicas as usize);
        stage.control[entry].push_back(Envelope::EofFirst { client_id: 7, messages_sent: total });

        let mut steps = 0;
        while stage.has_control() {
            if !undelivered.is_empty() && rng.gen_bool(0.5) {
                let replica = undelivered.remove(0);
                let outputs = rng.gen_range(0..3);
                stage.deliver(replica, outputs);
            }
            if !undelivered.is_empty() {
                assert!(stage.downstream.is_empty(), "stage must not finish while messages are undelivered");
            }
            let replica = rng.gen_range(0..replicas as usize);
            stage.step(replica);
            steps += 1;
            if steps > 100_000 {
                bail!("EOF protocol did not converge for {} replicas and {} messages", replicas, total);
            }
        }

        assert!(undelivered.is_empty(), "expected drain to wait for every message");
        assert_eq!(stage.downstream.len(), 1, "expected exactly one downstream EOF, got {:?}", stage.downstream);
        let total_sent = stage.total_sent();
        assert_eq!(stage.downstream[0], (7, total_sent), "expected reconciled total {} got {:?}", total_sent, stage.downstream[0]);
        assert_eq!(stage.flushes.len(), replicas as usize, "expected one flush per replica");
        assert_eq!(stage.evictions.len(), replicas as usize, "expected one eviction per replica");
    }
    Ok(())
}

#[test]
fn multiple_eof_sources_are_summed() {
    let mut stage = Stage::new(2, 2);
    for _ in 0..5 {
        stage.deliver(0, 1);
        stage.deliver(1, 1);
    }
    stage.control[0].push_back(Envelope::EofFirst { client_id: 3, messages_sent: 4 });
    while stage.has_control() {
        stage.step(0);
        stage.step(1);
    }
    assert!(stage.downstream.is_empty(), "expected the stage to wait on its second source");
    assert_eq!(stage.coordinators[0].phase(3), EofPhase::Active);

    stage.control[1].push_back(Envelope::EofFirst { client_id: 3, messages_sent: 6 });
    while stage.has_control() {
        stage.step(0);
        stage.step(1);
    }
    assert_eq!(stage.downstream, vec![(3, 11)], "expected both sources summed, got {:?}", stage.downstream);
}

#[test]
fn duplicate_eof_first_is_ignored() {
    let mut coordinator = EofCoordinator::new(0, 2, 1);
    let counts = ClientCounts { received: 1, sent: 1 };
    let first = coordinator.handle(Envelope::EofFirst { client_id: 1, messages_sent: 3 }, counts);
    assert!(
        matches!(first.as_slice(), [EofAction::Forward { to: 1, envelope: Envelope::EofRequeue { ttl: 0, remaining: 2, .. }, delayed: false }]),
        "expected token forwarded to replica 1 with 2 remaining, got {:?}",
        first
    );
    let second = coordinator.handle(Envelope::EofFirst { client_id: 1, messages_sent: 3 }, counts);
    assert!(second.is_empty(), "expected duplicate EofFirst to be ignored, got {:?}", second);
}

#[test]
fn undrained_token_at_ttl_zero_is_delayed() {
    let mut coordinator = EofCoordinator::new(1, 2, 1);
    let token = Envelope::EofRequeue {
        client_id: 1,
        ttl: 0,
        remaining: 5,
        messages_sent: 0,
        original_sender_sent: 5,
    };
    let actions = coordinator.handle(token, ClientCounts { received: 2, sent: 0 });
    assert_eq!(
        actions,
        vec![EofAction::Forward {
            to: 0,
            envelope: Envelope::EofRequeue {
                client_id: 1,
                ttl: 0,
                remaining: 3,
                messages_sent: 0,
                original_sender_sent: 5,
            },
            delayed: true,
        }]
    );

    // Only the delta since the last visit is folded.
    let token = Envelope::EofRequeue {
        client_id: 1,
        ttl: 0,
        remaining: 3,
        messages_sent: 0,
        original_sender_sent: 5,
    };
    let actions = coordinator.handle(token, ClientCounts { received: 3, sent: 0 });
    assert!(
        matches!(actions.as_slice(), [EofAction::Forward { envelope: Envelope::EofRequeue { remaining: 2, .. }, delayed: true, .. }]),
        "expected only one newly received message to be subtracted, got {:?}",
        actions
    );
}

#[test]
fn stale_tokens_of_evicted_clients_are_ignored() {
    let mut coordinator = EofCoordinator::new(0, 1, 1);
    let evict = coordinator.handle(Envelope::EofCallbackSpecial { client_id: 9 }, ClientCounts::default());
    assert_eq!(evict, vec![EofAction::Evict { client_id: 9 }]);
    let again = coordinator.handle(Envelope::EofCallbackSpecial { client_id: 9 }, ClientCounts::default());
    assert!(again.is_empty(), "expected a repeated callback to be a no-op");

    let stale = Envelope::EofFinish {
        client_id: 9,
        ttl: 0,
        messages_sent: 1,
    };
    assert!(!coordinator.should_flush(&stale), "expected no flush for an evicted client");
    assert!(coordinator.handle(stale, ClientCounts::default()).is_empty(), "expected stale token to be ignored");
}

#[test]
fn only_recently_evicted_clients_are_remembered() {
    let mut coordinator = EofCoordinator::new(0, 1, 1);
    for client_id in 1..=(EVICTED_RETAINED as u32 + 1) {
        coordinator.handle(Envelope::EofCallbackSpecial { client_id }, ClientCounts::default());
    }
    assert_eq!(coordinator.phase(1), EofPhase::Active, "expected the oldest evicted client to be forgotten");
    assert_eq!(coordinator.phase(2), EofPhase::Done, "expected client 2 to still be remembered");
    let newest = EVICTED_RETAINED as u32 + 1;
    assert_eq!(coordinator.phase(newest), EofPhase::Done, "expected the newest evicted client to be remembered");
}
