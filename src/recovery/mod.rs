//! Crash recovery.
//!
//! A worker rebuilds its per-client counters, processor snapshots and duplicate filters from its
//! recovery log at startup.

mod duplicates;
mod log;
#[cfg(test)]
mod duplicates_test;

use std::collections::{HashMap, HashSet};

use anyhow::Result;

pub use self::duplicates::DuplicateCatcher;
pub use self::log::{DurableLog, LogRecord, SavedState};

/// The state of a worker rebuilt from its recovery log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreState {
    pub messages_received: HashMap<u32, u64>,
    pub messages_sent: HashMap<u32, u64>,
    /// Messages whose outputs may already have been published, but which were never committed.
    pub possible_duplicates: HashMap<u32, HashSet<u64>>,
    /// Messages which were fully handled.
    pub processed: HashMap<u32, HashSet<u64>>,
    /// Processor snapshots, by client.
    pub snapshots: HashMap<u32, Vec<u8>>,
}

/// The restored state of a single client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientRestore {
    pub received: u64,
    pub sent: u64,
    pub snapshot: Option<Vec<u8>>,
    /// The message IDs the client's duplicate catcher starts with.
    pub duplicates: Vec<u64>,
}

impl RestoreState {
    /// Remove and return the restored state of the given client.
    ///
    /// A client unknown to the log restores to zeroed counters and an empty seed.
    pub fn take_client(&mut self, client_id: u32) -> ClientRestore {
        let mut duplicates: Vec<u64> = self.possible_duplicates.remove(&client_id).unwrap_or_default().into_iter().collect();
        duplicates.extend(self.processed.remove(&client_id).unwrap_or_default());
        ClientRestore {
            received: self.messages_received.remove(&client_id).unwrap_or(0),
            sent: self.messages_sent.remove(&client_id).unwrap_or(0),
            snapshot: self.snapshots.remove(&client_id),
            duplicates,
        }
    }

    /// All clients with any restored state.
    pub fn clients(&self) -> HashSet<u32> {
        self.messages_received
            .keys()
            .chain(self.messages_sent.keys())
            .chain(self.possible_duplicates.keys())
            .chain(self.processed.keys())
            .chain(self.snapshots.keys())
            .copied()
            .collect()
    }
}

/// Rebuild the worker state recorded in the given log.
#[tracing::instrument(level = "debug", skip(log), fields(path = %log.path().display()))]
pub async fn restore(log: &DurableLog) -> Result<RestoreState> {
    let records = log.records_rev().await?;
    let state = restore_from_records(records);
    tracing::debug!(clients = state.clients().len(), "recovery log replayed");
    Ok(state)
}

/// The progress of the most recent message of the log.
enum Tail {
    /// Outputs sent, save not complete. `published` is `None` until its SENT record is found.
    Sent { message_id: u64, client_id: u32, published: Option<u64> },
    /// Save complete, commit missing.
    Saved { message_id: u64, client_id: u32 },
    /// Started or committed, nothing to adjust.
    Settled,
}

/// Rebuild worker state from log records, most recent first.
pub fn restore_from_records(records: impl IntoIterator<Item = LogRecord>) -> RestoreState {
    let mut state = RestoreState::default();
    let mut tail: Option<Tail> = None;
    let mut saves_done: HashSet<(u64, u32)> = HashSet::new();
    let mut saved_clients: HashSet<u32> = HashSet::new();

    for record in records {
        if tail.is_none() {
            tail = Some(match &record {
                LogRecord::Sent { message_id, client_id, published } => Tail::Sent {
                    message_id: *message_id,
                    client_id: *client_id,
                    published: Some(*published),
                },
                LogRecord::SaveBegin { message_id, client_id, .. } => Tail::Sent {
                    message_id: *message_id,
                    client_id: *client_id,
                    published: None,
                },
                LogRecord::SaveDone { message_id, client_id } => Tail::Saved {
                    message_id: *message_id,
                    client_id: *client_id,
                },
                LogRecord::Start { .. } | LogRecord::Commit { .. } => Tail::Settled,
            });
        }

        match record {
            LogRecord::Commit { message_id, client_id } => {
                state.processed.entry(client_id).or_default().insert(message_id);
            }
            LogRecord::SaveDone { message_id, client_id } => {
                saves_done.insert((message_id, client_id));
            }
            LogRecord::SaveBegin {
                message_id,
                client_id,
                state: saved,
            } => {
                // Only a completed save counts, and only the most recent one per client.
                if !saves_done.remove(&(message_id, client_id)) || !saved_clients.insert(client_id) {
                    continue;
                }
                state.messages_received.insert(client_id, saved.received);
                state.messages_sent.insert(client_id, saved.sent);
                if let Some(snapshot) = saved.processor {
                    state.snapshots.insert(client_id, snapshot);
                }
            }
            LogRecord::Sent {
                message_id,
                client_id,
                published,
            } => {
                // An incomplete save at the tail still needs the published count of its message.
                if let Some(Tail::Sent {
                    message_id: tail_message,
                    client_id: tail_client,
                    published: tail_published @ None,
                }) = tail.as_mut()
                {
                    if *tail_message == message_id && *tail_client == client_id {
                        *tail_published = Some(published);
                    }
                }
            }
            LogRecord::Start { .. } => (),
        }
    }

    match tail {
        // Nothing of the message reached the broker, so its redelivery is simply processed again
        // on top of the last snapshot.
        Some(Tail::Sent { published: Some(0), .. }) => (),
        Some(Tail::Sent {
            message_id,
            client_id,
            published,
        }) => {
            *state.messages_received.entry(client_id).or_default() += 1;
            *state.messages_sent.entry(client_id).or_default() += published.unwrap_or(0);
            state.possible_duplicates.entry(client_id).or_default().insert(message_id);
        }
        Some(Tail::Saved { message_id, client_id }) => {
            state.possible_duplicates.entry(client_id).or_default().insert(message_id);
        }
        Some(Tail::Settled) | None => (),
    }
    state
}
