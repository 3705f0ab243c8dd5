//! Raft node driving a raft-rs `RawNode` in a single task.
//!
//! The task ticks the group, steps inbound messages, proposes, and processes
//! every `Ready`: messages out, snapshot in, committed entries applied to the
//! state machine in log order, entries and hard state persisted. It is the only
//! caller of the state machine, so applies never overlap.

#![allow(clippy::field_reassign_with_default)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use protobuf::Message as PbMessage;
use raft::{prelude::*, StateRole};
use serde::{Deserialize, Serialize};
use slog::{o, Drain};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{self, Duration, Instant};

use super::proposal::{Proposal, ProposalKind};
use super::storage::LogStore;
use super::{Commit, ConsensusEngine, ConsensusError, Leadership, Member, StateMachine};

const LOGGER_CHANNEL_SIZE: usize = 4096; // Size of logger channel buffer
const MAILBOX_SIZE: usize = 1000;
const PROPOSAL_QUEUE_SIZE: usize = 1024;

/// Raft id of a node, derived from its string identifier.
pub fn raft_id(node_id: &str) -> u64 {
    match fxhash::hash64(node_id) {
        0 => 1,
        id => id,
    }
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub member: Member,
    /// Start as the single voter of a new cluster.
    pub bootstrap: bool,
    pub tick: Duration,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub snapshot_interval: Duration,
    /// Applied entries since the last snapshot required before taking another.
    pub snapshot_threshold: u64,
    pub membership_timeout: Duration,
}

/// Mailboxes for the consensus transport: the node reads peers' messages from
/// `inbound` and writes its own to `outbound`, addressed by `Message::to`.
///
/// A transport registers every address it delivers to with
/// [`RaftHandle::link_peer`]; peers at other addresses are never admitted.
pub struct Mailboxes {
    pub inbound: Sender<Message>,
    pub outbound: Receiver<Message>,
}

/// Replicated member table plus the local node's view of leadership.
#[derive(Debug)]
struct ClusterView {
    role: StateRole,
    leader_id: u64,
    members: BTreeMap<u64, Member>,
}

impl ClusterView {
    fn set_members(&mut self, members: Vec<Member>) {
        self.members = members
            .into_iter()
            .map(|m| (raft_id(&m.id), m))
            .collect();
    }
}

type SharedView = Arc<RwLock<ClusterView>>;

/// Payload of a raft snapshot.
#[derive(Serialize, Deserialize)]
struct EngineSnapshot {
    members: Vec<Member>,
    state: Vec<u8>,
}

fn default_config(id: u64, options: &NodeOptions) -> Config {
    Config {
        id,
        election_tick: options.election_tick,
        heartbeat_tick: options.heartbeat_tick,
        ..Default::default()
    }
}

fn storage_error(e: impl ToString) -> ConsensusError {
    ConsensusError::Storage(e.to_string())
}

fn build_logger() -> slog::Logger {
    #[cfg(feature = "slog-term")]
    {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain)
            .chan_size(LOGGER_CHANNEL_SIZE)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse();
        slog::Logger::root(drain, o!())
    }
    #[cfg(not(feature = "slog-term"))]
    {
        let _ = LOGGER_CHANNEL_SIZE;
        slog::Logger::root(slog::Discard, o!())
    }
}

pub struct RaftNode {
    raft_group: RawNode<LogStore>,
    out_mailbox: Sender<Message>,
    my_mailbox: Receiver<Message>,
    state_machine: Arc<dyn StateMachine>,
    proposals: Receiver<Proposal>,
    proposed: VecDeque<Proposal>,
    view: SharedView,
    options: NodeOptions,
}

impl RaftNode {
    /// Creates the node, spawns its task and returns the engine handle plus
    /// the transport mailboxes.
    pub async fn start(
        options: NodeOptions,
        state_machine: Arc<dyn StateMachine>,
    ) -> Result<(RaftHandle, Mailboxes), ConsensusError> {
        let id = raft_id(&options.member.id);
        let logger = build_logger().new(o!("tag" => format!("peer_{}", id)));

        let mut members = BTreeMap::new();
        let storage = if options.bootstrap {
            members.insert(id, options.member.clone());
            let state = Self::capture_state(state_machine.as_ref()).await?;
            let data = bincode::serialize(&EngineSnapshot {
                members: vec![options.member.clone()],
                state,
            })
            .map_err(storage_error)?;
            LogStore::bootstrap(id, data)
        } else {
            LogStore::new()
        };

        let cfg = default_config(id, &options);
        let mut raft_group = RawNode::new(&cfg, storage, &logger).map_err(storage_error)?;
        if options.bootstrap {
            raft_group.campaign().map_err(storage_error)?;
        }

        let view = Arc::new(RwLock::new(ClusterView {
            role: StateRole::Follower,
            leader_id: raft::INVALID_ID,
            members,
        }));
        let (inbound, my_mailbox) = mpsc::channel(MAILBOX_SIZE);
        let (out_mailbox, outbound) = mpsc::channel(MAILBOX_SIZE);
        let (proposals_tx, proposals) = mpsc::channel(PROPOSAL_QUEUE_SIZE);

        let handle = RaftHandle {
            proposals: proposals_tx,
            view: view.clone(),
            links: Arc::new(RwLock::new(HashSet::from([options.member.address.clone()]))),
            membership_timeout: options.membership_timeout,
        };
        let node = RaftNode {
            raft_group,
            out_mailbox,
            my_mailbox,
            state_machine,
            proposals,
            proposed: VecDeque::new(),
            view,
            options,
        };

        log::info!(
            "starting raft node {} ({}), bootstrap: {}",
            node.options.member.id,
            id,
            node.options.bootstrap
        );
        tokio::spawn(node.run_background_tasks());
        Ok((handle, Mailboxes { inbound, outbound }))
    }

    async fn capture_state(state_machine: &dyn StateMachine) -> Result<Vec<u8>, ConsensusError> {
        let snapshot = state_machine.snapshot().await;
        let mut state = Vec::new();
        let persisted = snapshot.persist(&mut state);
        snapshot.release();
        persisted.map_err(storage_error)?;
        Ok(state)
    }

    fn store(&self) -> &LogStore {
        &self.raft_group.raft.raft_log.store
    }

    fn view(&self) -> std::sync::RwLockWriteGuard<'_, ClusterView> {
        self.view.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Main event loop that handles messages, proposals, and periodic tasks.
    async fn run_background_tasks(mut self) {
        let mut ticker = time::interval(self.options.tick);
        let mut last_snapshot = Instant::now();

        loop {
            tokio::select! {
                Some(msg) = self.my_mailbox.recv() => {
                    let _ = self.raft_group.step(msg);
                    while let Ok(msg) = self.my_mailbox.try_recv() {
                        let _ = self.raft_group.step(msg);
                    }
                }
                proposal = self.proposals.recv() => match proposal {
                    Some(proposal) => {
                        self.propose(proposal);
                        while let Ok(proposal) = self.proposals.try_recv() {
                            self.propose(proposal);
                        }
                    }
                    None => {
                        log::info!("all engine handles dropped, stopping raft node");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.raft_group.tick();
                }
            }

            if let Err(e) = self.on_ready().await {
                log::error!("raft node {} stopped: {}", self.options.member.id, e);
                break;
            }
            self.sync_view();

            if last_snapshot.elapsed() >= self.options.snapshot_interval {
                match self.maybe_save_snapshot().await {
                    Ok(true) => last_snapshot = Instant::now(),
                    Ok(false) => {}
                    Err(e) => log::error!("failed to save snapshot: {}", e),
                }
            }
        }

        self.fail_proposed(ConsensusError::Stopped);
        self.proposals.close();
        while let Ok(mut proposal) = self.proposals.try_recv() {
            proposal.finish(Err(ConsensusError::Stopped));
        }
    }

    /// Handles the ready state: messages, snapshot, committed entries, persistence.
    async fn on_ready(&mut self) -> Result<(), ConsensusError> {
        if !self.raft_group.has_ready() {
            return Ok(());
        }

        let mut ready = self.raft_group.ready();

        // Step 1: Handle messages
        if !ready.messages().is_empty() {
            self.send_messages(ready.take_messages());
        }

        // Step 2: Handle snapshot if any
        if *ready.snapshot() != Snapshot::default() {
            self.install_snapshot(ready.snapshot().clone()).await?;
        }

        // Step 3: Handle committed entries
        self.handle_committed_entries(ready.take_committed_entries())
            .await?;

        // Step 4: Persist raft state
        self.store().append(ready.entries()).map_err(storage_error)?;
        if let Some(hs) = ready.hs() {
            self.store().set_hardstate(hs.clone());
        }
        if !ready.persisted_messages().is_empty() {
            self.send_messages(ready.take_persisted_messages());
        }

        // Step 5: Advance raft state
        let mut light_rd = self.raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.store().set_commit(commit);
        }
        self.send_messages(light_rd.take_messages());
        self.handle_committed_entries(light_rd.take_committed_entries())
            .await?;
        self.raft_group.advance_apply();
        Ok(())
    }

    fn send_messages(&self, messages: Vec<Message>) {
        for msg in messages {
            if let Err(e) = self.out_mailbox.try_send(msg) {
                log::error!("Failed to send raft message {:?}, Raft will retry", e);
            }
        }
    }

    /// Replaces the state machine and member table with a leader's snapshot.
    async fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(), ConsensusError> {
        let index = snapshot.get_metadata().index;
        let payload: EngineSnapshot =
            bincode::deserialize(snapshot.get_data()).map_err(storage_error)?;
        self.store()
            .apply_snapshot(snapshot)
            .map_err(storage_error)?;

        let mut state = payload.state.as_slice();
        self.state_machine
            .restore(&mut state)
            .await
            .map_err(storage_error)?;
        self.view().set_members(payload.members);
        log::info!("installed snapshot at index {}", index);
        Ok(())
    }

    async fn handle_committed_entries(&mut self, entries: Vec<Entry>) -> Result<(), ConsensusError> {
        for entry in entries {
            if !entry.data.is_empty() {
                match entry.get_entry_type() {
                    EntryType::EntryConfChange => self.apply_conf_change(&entry)?,
                    EntryType::EntryNormal => {
                        self.state_machine.apply(entry.index, &entry.data).await
                    }
                    EntryType::EntryConfChangeV2 => {
                        log::warn!("ignoring joint conf change at index {}", entry.index)
                    }
                }
            }
            self.notice_proposed(&entry);
        }
        Ok(())
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<(), ConsensusError> {
        let mut cc = ConfChange::default();
        cc.merge_from_bytes(&entry.data).map_err(storage_error)?;
        let cs = match self.raft_group.apply_conf_change(&cc) {
            Ok(cs) => cs,
            Err(e) => {
                log::error!("rejected conf change at index {}: {}", entry.index, e);
                return Ok(());
            }
        };
        self.store().set_conf_state(cs);

        if !cc.context.is_empty() {
            let members: Vec<Member> = bincode::deserialize(&cc.context).map_err(storage_error)?;
            log::info!(
                "membership at index {}: {:?}",
                entry.index,
                members.iter().map(|m| m.id.as_str()).collect::<Vec<_>>()
            );
            self.view().set_members(members);
        }
        Ok(())
    }

    /// Completes the proposals up to `entry`. A proposal succeeds only if the
    /// entry applied at its index is the one it proposed.
    fn notice_proposed(&mut self, entry: &Entry) {
        while let Some(front) = self.proposed.front() {
            if front.proposed > entry.index {
                break;
            }
            let Some(mut proposal) = self.proposed.pop_front() else {
                break;
            };
            let expected_type = if proposal.is_conf_change() {
                EntryType::EntryConfChange
            } else {
                EntryType::EntryNormal
            };
            let ours = proposal.proposed == entry.index
                && proposal.term == entry.term
                && entry.get_entry_type() == expected_type
                && !entry.data.is_empty();
            proposal.finish(if ours {
                Ok(())
            } else {
                Err(ConsensusError::Dropped)
            });
        }
    }

    fn fail_proposed(&mut self, err: ConsensusError) {
        for mut proposal in self.proposed.drain(..) {
            proposal.finish(Err(err.clone()));
        }
    }

    /// Publishes role and leader; fails in-flight proposals on step-down.
    fn sync_view(&mut self) {
        let role = self.raft_group.raft.state;
        let leader_id = self.raft_group.raft.leader_id;
        let stepped_down = {
            let mut view = self.view();
            let stepped_down = view.role == StateRole::Leader && role != StateRole::Leader;
            if view.role != role || view.leader_id != leader_id {
                log::info!(
                    "raft node {} is now {:?}, leader {}",
                    self.options.member.id,
                    role,
                    leader_id
                );
            }
            view.role = role;
            view.leader_id = leader_id;
            stepped_down
        };
        if stepped_down {
            self.fail_proposed(ConsensusError::NotLeader);
        }
    }

    /// Snapshots the state machine and compacts the log once enough entries
    /// have been applied since the last snapshot.
    async fn maybe_save_snapshot(&mut self) -> Result<bool, ConsensusError> {
        let applied = self.raft_group.raft.raft_log.applied();
        if applied < self.store().snapshot_index() + self.options.snapshot_threshold {
            return Ok(false);
        }

        let state = Self::capture_state(self.state_machine.as_ref()).await?;
        let members = self
            .view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .values()
            .cloned()
            .collect();
        let data = bincode::serialize(&EngineSnapshot { members, state }).map_err(storage_error)?;

        let term = self
            .raft_group
            .raft
            .raft_log
            .term(applied)
            .map_err(storage_error)?;
        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = applied;
        snapshot.mut_metadata().term = term;
        snapshot
            .mut_metadata()
            .set_conf_state(self.store().conf_state().map_err(storage_error)?);
        snapshot.set_data(data.into());

        self.store().compact_to(snapshot).map_err(storage_error)?;
        log::info!("Save snapshot at index: {}", applied);
        Ok(true)
    }

    /// Submits a new proposal to the Raft group if this node is the leader.
    fn propose(&mut self, mut proposal: Proposal) {
        if self.raft_group.raft.state != StateRole::Leader {
            proposal.finish(Err(ConsensusError::NotLeader));
            return;
        }

        let last_index = self.raft_group.raft.raft_log.last_index() + 1;
        let proposed = match &proposal.kind {
            ProposalKind::Normal(data) => self.raft_group.propose(vec![], data.clone()),
            ProposalKind::ConfChange(cc) => self.raft_group.propose_conf_change(vec![], cc.clone()),
        };
        if let Err(e) = proposed {
            log::warn!("proposal rejected: {}", e);
            proposal.finish(Err(ConsensusError::Dropped));
            return;
        }

        let new_last_index = self.raft_group.raft.raft_log.last_index() + 1;
        if new_last_index == last_index {
            proposal.finish(Err(ConsensusError::Dropped));
        } else {
            proposal.proposed = last_index;
            proposal.term = self.raft_group.raft.term;
            self.proposed.push_back(proposal);
        }
    }
}

/// [`ConsensusEngine`] backed by a [`RaftNode`] task.
#[derive(Clone)]
pub struct RaftHandle {
    proposals: Sender<Proposal>,
    view: SharedView,
    /// Addresses the transport delivers to, this node's own included.
    links: Arc<RwLock<HashSet<String>>>,
    membership_timeout: Duration,
}

impl RaftHandle {
    /// Records that the transport now delivers messages to `address`.
    pub fn link_peer(&self, address: impl Into<String>) {
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.into());
    }

    fn members(&self) -> Vec<Member> {
        self.view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .values()
            .cloned()
            .collect()
    }

    async fn change_membership(
        &self,
        change_type: ConfChangeType,
        node_id: u64,
        members: Vec<Member>,
    ) -> Result<(), ConsensusError> {
        if !self.leader().is_leader {
            return Err(ConsensusError::NotLeader);
        }
        let (proposal, rx) = Proposal::conf_change(change_type, node_id, &members)?;
        self.proposals
            .send(proposal)
            .await
            .map_err(|_| ConsensusError::Stopped)?;
        Commit::new(rx).wait(self.membership_timeout).await
    }
}

#[async_trait]
impl ConsensusEngine for RaftHandle {
    async fn submit(&self, command: Vec<u8>) -> Result<Commit, ConsensusError> {
        if !self.leader().is_leader {
            return Err(ConsensusError::NotLeader);
        }
        let (proposal, rx) = Proposal::normal(command);
        self.proposals
            .send(proposal)
            .await
            .map_err(|_| ConsensusError::Stopped)?;
        Ok(Commit::new(rx))
    }

    fn leader(&self) -> Leadership {
        let view = self.view.read().unwrap_or_else(PoisonError::into_inner);
        Leadership {
            is_leader: view.role == StateRole::Leader,
            leader: view.members.get(&view.leader_id).cloned(),
        }
    }

    async fn add_voter(&self, member: Member) -> Result<(), ConsensusError> {
        let node_id = raft_id(&member.id);
        let mut members = self.members();
        members.retain(|m| m.id != member.id);
        members.push(member);
        self.change_membership(ConfChangeType::AddNode, node_id, members)
            .await
    }

    async fn remove_server(&self, id: &str) -> Result<(), ConsensusError> {
        let mut members = self.members();
        members.retain(|m| m.id != id);
        self.change_membership(ConfChangeType::RemoveNode, raft_id(id), members)
            .await
    }

    async fn configuration(&self) -> Result<Vec<Member>, ConsensusError> {
        Ok(self.members())
    }

    fn reaches(&self, address: &str) -> bool {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::sync::Mutex;

    use crate::raft::StateSnapshot;

    /// Records applied commands; its snapshot is the list of commands.
    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<Vec<u8>>>,
    }

    struct RecorderSnapshot(Vec<Vec<u8>>);

    impl StateSnapshot for RecorderSnapshot {
        fn persist(&self, sink: &mut dyn Write) -> anyhow::Result<()> {
            bincode::serialize_into(sink, &self.0)?;
            Ok(())
        }
    }

    impl Recorder {
        fn applied(&self) -> Vec<Vec<u8>> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StateMachine for Recorder {
        async fn apply(&self, _index: u64, data: &[u8]) {
            self.applied.lock().unwrap().push(data.to_vec());
        }

        async fn snapshot(&self) -> Box<dyn StateSnapshot> {
            Box::new(RecorderSnapshot(self.applied()))
        }

        async fn restore(&self, reader: &mut (dyn Read + Send)) -> anyhow::Result<()> {
            *self.applied.lock().unwrap() = bincode::deserialize_from(reader)?;
            Ok(())
        }
    }

    fn options(name: &str, bootstrap: bool) -> NodeOptions {
        NodeOptions {
            member: Member::voter(format!("{}:127.0.0.1:7070", name), format!("{}-raft", name)),
            bootstrap,
            tick: Duration::from_millis(10),
            election_tick: 10,
            heartbeat_tick: 3,
            snapshot_interval: Duration::from_secs(3600),
            snapshot_threshold: 5,
            membership_timeout: Duration::from_secs(5),
        }
    }

    /// Routes every node's outbound messages to the addressee's inbound mailbox.
    fn wire(mailboxes: Vec<(u64, Mailboxes)>) {
        let inbound: HashMap<u64, Sender<Message>> = mailboxes
            .iter()
            .map(|(id, m)| (*id, m.inbound.clone()))
            .collect();
        for (_, Mailboxes { mut outbound, .. }) in mailboxes {
            let inbound = inbound.clone();
            tokio::spawn(async move {
                while let Some(msg) = outbound.recv().await {
                    if let Some(peer) = inbound.get(&msg.to) {
                        let _ = peer.send(msg).await;
                    }
                }
            });
        }
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn start(name: &str, bootstrap: bool) -> (RaftHandle, Mailboxes, Arc<Recorder>, NodeOptions) {
        let recorder = Arc::new(Recorder::default());
        let opts = options(name, bootstrap);
        let (handle, mailboxes) = RaftNode::start(opts.clone(), recorder.clone()).await.unwrap();
        (handle, mailboxes, recorder, opts)
    }

    #[test]
    fn test_raft_id_is_stable_and_nonzero() {
        assert_eq!(raft_id("node1:127.0.0.1:7070"), raft_id("node1:127.0.0.1:7070"));
        assert_ne!(raft_id("node1:127.0.0.1:7070"), raft_id("node2:127.0.0.1:7071"));
        assert_ne!(raft_id(""), 0);
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_applies() {
        let (handle, _mailboxes, recorder, opts) = start("solo", true).await;
        assert!(eventually(|| handle.leader().is_leader).await);
        assert_eq!(handle.leader().leader, Some(opts.member.clone()));

        let commit = handle.submit(b"first".to_vec()).await.unwrap();
        commit.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(recorder.applied(), vec![b"first".to_vec()]);
        assert_eq!(handle.configuration().await.unwrap(), vec![opts.member]);
    }

    #[tokio::test]
    async fn test_reaches_only_linked_peers() {
        let (handle, _mailboxes, _recorder, opts) = start("linked", true).await;
        assert!(handle.reaches(&opts.member.address));
        assert!(!handle.reaches("peer-raft"));

        handle.link_peer("peer-raft");
        assert!(handle.reaches("peer-raft"));
    }

    #[tokio::test]
    async fn test_unlinked_peer_is_not_admitted() {
        let (handle, mailboxes, recorder, _opts) = start("alone", true).await;
        let Mailboxes { mut outbound, .. } = mailboxes;
        tokio::spawn(async move { while outbound.recv().await.is_some() {} });
        assert!(eventually(|| handle.leader().is_leader).await);

        let err = crate::membership::join(&handle, "n2:127.0.0.1:7071", "n2-raft")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Consensus(ConsensusError::Unreachable(_))
        ));
        assert_eq!(handle.configuration().await.unwrap().len(), 1);

        handle
            .submit(b"still".to_vec())
            .await
            .unwrap()
            .wait(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(recorder.applied(), vec![b"still".to_vec()]);
    }

    #[tokio::test]
    async fn test_follower_refuses_to_submit() {
        let (handle, _mailboxes, _recorder, _opts) = start("lonely", false).await;
        assert!(!handle.leader().is_leader);
        assert_eq!(handle.leader().leader, None);
        assert_eq!(
            handle.submit(b"cmd".to_vec()).await.err(),
            Some(ConsensusError::NotLeader)
        );
    }

    #[tokio::test]
    async fn test_cluster_joins_and_replicates() {
        let (leader, leader_mb, leader_sm, leader_opts) = start("n1", true).await;
        let (f1, f1_mb, f1_sm, f1_opts) = start("n2", false).await;
        let (f2, f2_mb, f2_sm, f2_opts) = start("n3", false).await;
        wire(vec![
            (raft_id(&leader_opts.member.id), leader_mb),
            (raft_id(&f1_opts.member.id), f1_mb),
            (raft_id(&f2_opts.member.id), f2_mb),
        ]);
        assert!(eventually(|| leader.leader().is_leader).await);

        leader.submit(b"before".to_vec()).await.unwrap().wait(Duration::from_secs(5)).await.unwrap();
        leader.add_voter(f1_opts.member.clone()).await.unwrap();
        leader.add_voter(f2_opts.member.clone()).await.unwrap();
        assert_eq!(leader.configuration().await.unwrap().len(), 3);

        leader.submit(b"after".to_vec()).await.unwrap().wait(Duration::from_secs(5)).await.unwrap();
        let expected = vec![b"before".to_vec(), b"after".to_vec()];
        assert!(eventually(|| f1_sm.applied() == expected && f2_sm.applied() == expected).await);
        assert_eq!(leader_sm.applied(), expected);

        // Followers learn the member table and point at the leader.
        assert!(eventually(|| f1.leader().leader.as_ref() == Some(&leader_opts.member)).await);
        assert!(!f2.leader().is_leader);
        assert_eq!(f2.configuration().await.unwrap().len(), 3);
        assert_eq!(f1.submit(b"x".to_vec()).await.err(), Some(ConsensusError::NotLeader));
    }

    #[tokio::test]
    async fn test_snapshot_compacts_and_catches_up_late_joiner() {
        let recorder = Arc::new(Recorder::default());
        let mut opts = options("s1", true);
        opts.snapshot_interval = Duration::from_millis(0);
        opts.snapshot_threshold = 2;
        let (leader, leader_mb) = RaftNode::start(opts.clone(), recorder.clone()).await.unwrap();
        let (late, late_mb, late_sm, late_opts) = start("s2", false).await;
        wire(vec![
            (raft_id(&opts.member.id), leader_mb),
            (raft_id(&late_opts.member.id), late_mb),
        ]);
        assert!(eventually(|| leader.leader().is_leader).await);

        let mut expected = Vec::new();
        for n in 0..6u8 {
            leader.submit(vec![n]).await.unwrap().wait(Duration::from_secs(5)).await.unwrap();
            expected.push(vec![n]);
        }
        leader.add_voter(late_opts.member.clone()).await.unwrap();
        assert!(eventually(|| late_sm.applied() == expected).await);
        assert!(eventually(|| late.leader().leader.as_ref() == Some(&opts.member)).await);
    }
}
