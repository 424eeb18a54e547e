//! Raft node: raft-rs `RawNode` plus the state machine it drives.
//!
//! [`RaftNode`] owns the in-memory raft log and hands committed entries to
//! the [`StateMachine`] strictly in log order. It has no I/O of its own: the
//! runtime feeds it ticks and inbound messages, and ships the outbound
//! messages returned by [`RaftNode::poll_ready`].

use crate::common::{raft_id, Error, Result};
use crate::fsm::{snapshot, ApplyResponse, LogEntry, StateMachine};
use crate::raft::Server;
use protobuf::Message as PbMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, Config, Entry, EntryType, Message, MessageType, RawNode,
    Snapshot,
};
use raft::storage::MemStorage;
use raft::{ProgressState, SnapshotStatus, StateRole, Storage as _};
use serde::{Deserialize, Serialize};
use slog::{o, Logger};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

/// raft-rs logs through slog; we log at the application level instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Static settings for a [`RaftNode`]
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub id: u64,
    pub bootstrap: bool,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub snapshot_threshold: u64,
}

/// Carried in the context of a configuration-change entry so every replica
/// learns the member's name and address when the change commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipContext {
    /// Raft ID of the proposing node
    pub origin: u64,
    pub request: u64,
    pub server: Server,
}

/// A committed command, applied locally.
pub struct ApplyReport {
    pub index: u64,
    pub term: u64,
    /// Proposal ID, set only on the node that proposed the entry
    pub request: Option<u64>,
    pub response: Option<ApplyResponse>,
}

/// A committed configuration change, applied locally.
pub struct MembershipReport {
    pub index: u64,
    /// Proposal ID, set only on the node that proposed the change
    pub request: Option<u64>,
    pub raft_id: u64,
    pub removed: bool,
    pub context: Option<MembershipContext>,
    pub result: std::result::Result<(), String>,
}

pub enum Applied {
    Command(ApplyReport),
    Membership(MembershipReport),
}

/// Output of one pass over a raft `Ready`
#[derive(Default)]
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<Applied>,
}

pub struct RaftNode {
    id: u64,
    raw: RawNode<MemStorage>,
    storage: MemStorage,
    fsm: Arc<dyn StateMachine>,
    snapshot_threshold: u64,
    applied_index: u64,
    last_snapshot_index: u64,
    /// Followers sent a snapshot, with ticks spent waiting for them to take it
    snapshots_in_flight: HashMap<u64, usize>,
    snapshot_retry_ticks: usize,
}

impl RaftNode {
    /// Create a node.
    ///
    /// A bootstrap node starts from a snapshot at index 1 naming itself as
    /// the only voter. Other nodes start empty: they cannot campaign, and
    /// get their first configuration from the leader's snapshot once joined.
    /// Using a non-zero first index forces every joiner through that path.
    pub fn new(opts: NodeOptions, fsm: Arc<dyn StateMachine>) -> Result<Self> {
        let cfg = Config {
            id: opts.id,
            election_tick: opts.election_tick,
            heartbeat_tick: opts.heartbeat_tick,
            max_inflight_msgs: 256,
            ..Default::default()
        };
        cfg.validate()?;

        let storage = MemStorage::new();
        if opts.bootstrap {
            let mut snapshot = Snapshot::default();
            snapshot.mut_metadata().index = 1;
            snapshot.mut_metadata().term = 1;
            snapshot.mut_metadata().mut_conf_state().voters = vec![opts.id];
            storage.wl().apply_snapshot(snapshot)?;
        }

        let raw = RawNode::new(&cfg, storage.clone(), &silent_logger())?;
        let applied_index = if opts.bootstrap { 1 } else { 0 };
        Ok(Self {
            id: opts.id,
            raw,
            storage,
            fsm,
            snapshot_threshold: opts.snapshot_threshold,
            applied_index,
            last_snapshot_index: applied_index,
            snapshots_in_flight: HashMap::new(),
            snapshot_retry_ticks: opts.election_tick * 2,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tick(&mut self) {
        self.raw.tick();
        self.retry_stalled_snapshots();
    }

    pub fn campaign(&mut self) -> Result<()> {
        Ok(self.raw.campaign()?)
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Current leader's raft ID, or 0 if no leader is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn commit_index(&self) -> u64 {
        self.raw.raft.raft_log.committed
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn last_snapshot_index(&self) -> u64 {
        self.last_snapshot_index
    }

    pub fn first_log_index(&self) -> Result<u64> {
        Ok(self.storage.first_index()?)
    }

    pub fn last_log_index(&self) -> Result<u64> {
        Ok(self.storage.last_index()?)
    }

    /// A configuration change is proposed but not yet applied
    pub fn has_pending_conf(&self) -> bool {
        self.raw.raft.has_pending_conf()
    }

    /// Raft IDs of the current voters
    pub fn voters(&self) -> Result<Vec<u64>> {
        Ok(self.storage.initial_state()?.conf_state.voters)
    }

    /// Propose a command. The entry context holds this node's ID and
    /// `request`, so the committed entry can be matched back to its caller.
    pub fn propose(&mut self, request: u64, data: Vec<u8>) -> Result<()> {
        let mut context = Vec::with_capacity(16);
        context.extend_from_slice(&self.id.to_be_bytes());
        context.extend_from_slice(&request.to_be_bytes());
        Ok(self.raw.propose(context, data)?)
    }

    /// Propose adding (`removed == false`) or removing a voter.
    pub fn propose_membership(&mut self, request: u64, server: Server, removed: bool) -> Result<()> {
        let ctx = MembershipContext {
            origin: self.id,
            request,
            server,
        };
        let mut cc = ConfChange::default();
        cc.node_id = raft_id(&ctx.server.id);
        cc.set_change_type(if removed {
            ConfChangeType::RemoveNode
        } else {
            ConfChangeType::AddNode
        });
        cc.set_context(serde_json::to_vec(&ctx)?.into());
        Ok(self.raw.propose_conf_change(vec![], cc)?)
    }

    /// Feed a message from a peer. A snapshot whose image does not decode is
    /// refused before raft sees it, so neither the log nor the store moves;
    /// the leader sends a fresh one later.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        if msg.get_msg_type() == MessageType::MsgSnapshot {
            let image = &msg.get_snapshot().data[..];
            if let Err(e) = snapshot::read_image(image) {
                tracing::warn!(
                    node = self.id,
                    from = msg.from,
                    index = msg.get_snapshot().get_metadata().index,
                    "Refusing snapshot: {}",
                    e
                );
                return Err(Error::RestoreAborted(e.to_string()));
            }
        }
        Ok(self.raw.step(msg)?)
    }

    /// Process pending raft work, applying committed entries.
    ///
    /// Returns `None` when there is nothing to do. Follows the raft-rs
    /// Ready/LightReady protocol: snapshot, committed entries, log append and
    /// hard state first, then the post-advance commit index and entries.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut bundle = ReadyBundle::default();
        bundle.messages.extend(ready.take_messages());

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            self.install_snapshot(snapshot)?;
        }

        let committed = ready.take_committed_entries();
        self.apply_entries(committed, &mut bundle.applied);

        if !ready.entries().is_empty() {
            self.storage.wl().append(ready.entries())?;
        }
        if let Some(hard_state) = ready.hs() {
            self.storage.wl().set_hardstate(hard_state.clone());
        }
        bundle.messages.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);
        if let Some(commit) = light_ready.commit_index() {
            self.storage.wl().mut_hard_state().set_commit(commit);
        }
        bundle.messages.extend(light_ready.take_messages());
        let committed = light_ready.take_committed_entries();
        self.apply_entries(committed, &mut bundle.applied);
        self.raw.advance_apply();

        self.attach_images(&mut bundle.messages);
        self.maybe_compact()?;
        Ok(Some(bundle))
    }

    /// raft-rs snapshots carry only log metadata. Fill outgoing ones with the
    /// current key space so a follower that is behind the compacted log gets
    /// the data too. The image may be newer than the snapshot index; replaying
    /// the later entries over it converges to the same state.
    ///
    /// A snapshot that cannot be exported is dropped and reported as failed,
    /// which makes raft try again after a heartbeat.
    fn attach_images(&mut self, messages: &mut Vec<Message>) {
        let mut failed = Vec::new();
        messages.retain_mut(|msg| {
            if msg.get_msg_type() != MessageType::MsgSnapshot {
                return true;
            }
            let mut image = Vec::new();
            match self.fsm.export(&mut image) {
                Ok(records) => {
                    tracing::info!(
                        node = self.id,
                        to = msg.to,
                        index = msg.get_snapshot().get_metadata().index,
                        records,
                        "Sending snapshot"
                    );
                    msg.mut_snapshot().set_data(image.into());
                    self.snapshots_in_flight.insert(msg.to, 0);
                    true
                }
                Err(e) => {
                    tracing::error!(node = self.id, to = msg.to, "Snapshot export failed: {}", e);
                    failed.push(msg.to);
                    false
                }
            }
        });
        for to in failed {
            self.raw.report_snapshot(to, SnapshotStatus::Failure);
        }
    }

    /// Report snapshots a follower never acknowledged, so the leader sends
    /// another instead of waiting on that follower forever.
    fn retry_stalled_snapshots(&mut self) {
        if self.snapshots_in_flight.is_empty() {
            return;
        }
        if self.role() != StateRole::Leader {
            self.snapshots_in_flight.clear();
            return;
        }

        let limit = self.snapshot_retry_ticks;
        let progress = self.raw.raft.prs();
        let mut stalled = Vec::new();
        self.snapshots_in_flight.retain(|id, ticks| match progress.get(*id) {
            Some(pr) if pr.state == ProgressState::Snapshot => {
                *ticks += 1;
                if *ticks < limit {
                    return true;
                }
                stalled.push(*id);
                false
            }
            _ => false,
        });
        for id in stalled {
            tracing::warn!(node = self.id, to = id, "Snapshot not acknowledged, retrying");
            self.raw.report_snapshot(id, SnapshotStatus::Failure);
        }
    }

    /// Replace the store with the snapshot image, then move the raft log.
    /// The log never gets ahead of the store.
    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let index = snapshot.get_metadata().index;
        let data = snapshot.data.to_vec();
        let installed = self.fsm.install(Box::new(Cursor::new(data)))?;
        self.storage.wl().apply_snapshot(snapshot)?;

        tracing::info!(
            node = self.id,
            index,
            installed,
            "Installed snapshot from leader"
        );
        self.applied_index = index;
        self.last_snapshot_index = index;
        Ok(())
    }

    fn apply_entries(&mut self, entries: Vec<Entry>, applied: &mut Vec<Applied>) {
        for entry in entries {
            self.applied_index = entry.index;
            match entry.get_entry_type() {
                EntryType::EntryNormal => {
                    // Leaders append an empty entry on election
                    if entry.data.is_empty() {
                        continue;
                    }
                    let log = LogEntry::command(entry.index, entry.term, entry.data.to_vec());
                    let response = self.fsm.apply(&log);
                    applied.push(Applied::Command(ApplyReport {
                        index: entry.index,
                        term: entry.term,
                        request: self.own_request(&entry.context),
                        response,
                    }));
                }
                EntryType::EntryConfChange => {
                    if let Some(report) = self.apply_conf_change(&entry) {
                        applied.push(Applied::Membership(report));
                    }
                }
                EntryType::EntryConfChangeV2 => {
                    tracing::warn!(index = entry.index, "Ignoring joint configuration change");
                }
            }
        }
    }

    fn own_request(&self, context: &[u8]) -> Option<u64> {
        decode_context(context)
            .filter(|(origin, _)| *origin == self.id)
            .map(|(_, request)| request)
    }

    /// `None` for an entry that does not decode; it is skipped like any
    /// other rejected entry.
    fn apply_conf_change(&mut self, entry: &Entry) -> Option<MembershipReport> {
        let mut cc = ConfChange::default();
        if let Err(e) = cc.merge_from_bytes(&entry.data) {
            tracing::warn!(index = entry.index, "Skipping undecodable configuration change: {}", e);
            return None;
        }

        let removed = cc.get_change_type() == ConfChangeType::RemoveNode;
        let context = serde_json::from_slice::<MembershipContext>(&cc.context).ok();
        let request = context
            .as_ref()
            .filter(|ctx| ctx.origin == self.id)
            .map(|ctx| ctx.request);

        let result = match self.raw.apply_conf_change(&cc) {
            Ok(conf_state) => {
                self.storage.wl().set_conf_state(conf_state);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(index = entry.index, "Configuration change rejected: {}", e);
                Err(e.to_string())
            }
        };

        Some(MembershipReport {
            index: entry.index,
            request,
            raft_id: cc.node_id,
            removed,
            context,
            result,
        })
    }

    /// Compact the log once `snapshot_threshold` entries have been applied
    /// since the last snapshot. The state machine's snapshot is persisted and
    /// released first; log entries are dropped only after that.
    fn maybe_compact(&mut self) -> Result<()> {
        if self.snapshot_threshold == 0
            || self.applied_index < self.last_snapshot_index + self.snapshot_threshold
        {
            return Ok(());
        }

        let mut snapshot = self.fsm.snapshot()?;
        let mut sink = Vec::new();
        snapshot.persist(&mut sink)?;
        snapshot.release();

        self.storage.wl().compact(self.applied_index)?;
        self.last_snapshot_index = self.applied_index;
        tracing::info!(
            node = self.id,
            index = self.applied_index,
            bytes = sink.len(),
            "Compacted raft log"
        );
        Ok(())
    }
}

/// Split an entry context into (proposer, request).
fn decode_context(context: &[u8]) -> Option<(u64, u64)> {
    if context.len() != 16 {
        return None;
    }
    let (origin, request) = context.split_at(8);
    Some((
        u64::from_be_bytes(origin.try_into().ok()?),
        u64::from_be_bytes(request.try_into().ok()?),
    ))
}
