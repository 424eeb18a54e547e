//! Raft worker runtime
//!
//! One tokio task owns the [`RaftNode`] and processes three kinds of events:
//! 1. **Requests** from [`RaftHandle`] (proposals, membership changes,
//!    configuration queries)
//! 2. **Peer messages** from the transport listener
//! 3. **Ticks** driving raft's election and heartbeat timeouts
//!
//! Callers never touch raft state directly. Each proposal registers a oneshot
//! waiter keyed by request ID; the worker completes it when the entry is
//! applied locally.

use crate::common::{raft_id, Config, Error, Result};
use crate::fsm::{ApplyResponse, StateMachine};
use crate::raft::node::{Applied, ApplyReport, MembershipReport, NodeOptions, RaftNode};
use crate::raft::transport::{self, Inbound, Transport};
use crate::raft::{ClusterConfiguration, Consensus, RaftState, Server};
use raft::prelude::{Message, MessageType};
use raft::StateRole;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const REQUEST_QUEUE_DEPTH: usize = 1024;
const INBOUND_QUEUE_DEPTH: usize = 4096;

/// Settings for a raft worker
#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub node_id: String,
    pub raft_addr: SocketAddr,
    pub bootstrap: bool,
    pub tick_interval: Duration,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub snapshot_threshold: u64,
}

impl RaftOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            node_id: config.node_id.clone(),
            raft_addr: config.raft_addr,
            bootstrap: config.bootstrap,
            tick_interval: config.tick_interval(),
            election_tick: config.election_tick,
            heartbeat_tick: config.heartbeat_tick,
            snapshot_threshold: config.snapshot_threshold,
        }
    }
}

type ApplyWaiter = oneshot::Sender<Result<Option<ApplyResponse>>>;
type MembershipWaiter = oneshot::Sender<Result<()>>;

enum Request {
    Propose {
        data: Vec<u8>,
        respond_to: ApplyWaiter,
    },
    Membership {
        server: Server,
        removed: bool,
        respond_to: MembershipWaiter,
    },
    Configuration {
        respond_to: oneshot::Sender<ClusterConfiguration>,
    },
    Shutdown,
}

/// Published by the worker after every event
#[derive(Debug, Clone)]
struct Status {
    state: RaftState,
    stats: BTreeMap<String, String>,
}

/// Handle to a running raft worker.
#[derive(Clone)]
pub struct RaftHandle {
    local: Server,
    requests: mpsc::Sender<Request>,
    status: Arc<RwLock<Status>>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Bind the raft listener and start the worker.
///
/// A bootstrap node becomes the only voter of a new cluster and campaigns
/// immediately. Any other node waits to be joined by a leader.
pub async fn spawn_raft(options: RaftOptions, fsm: Arc<dyn StateMachine>) -> Result<RaftHandle> {
    let listener = TcpListener::bind(options.raft_addr).await?;
    let local = Server {
        id: options.node_id.clone(),
        address: listener.local_addr()?.to_string(),
    };

    let mut node = RaftNode::new(
        NodeOptions {
            id: raft_id(&options.node_id),
            bootstrap: options.bootstrap,
            election_tick: options.election_tick,
            heartbeat_tick: options.heartbeat_tick,
            snapshot_threshold: options.snapshot_threshold,
        },
        fsm,
    )?;
    if options.bootstrap {
        node.campaign()?;
    }

    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
    let listener_task = transport::spawn_listener(listener, inbound_tx);

    let status = Arc::new(RwLock::new(Status {
        state: RaftState::Follower,
        stats: BTreeMap::new(),
    }));

    let mut worker = Worker::new(node, local.clone(), status.clone());
    worker.publish_status();

    tracing::info!(
        node_id = %local.id,
        raft_id = worker.node.id(),
        raft_addr = %local.address,
        bootstrap = options.bootstrap,
        "Raft worker started"
    );

    let tick_interval = options.tick_interval;
    let task = tokio::spawn(async move {
        worker.run(request_rx, inbound_rx, tick_interval).await;
        listener_task.abort();
    });

    Ok(RaftHandle {
        local,
        requests: request_tx,
        status,
        worker: Arc::new(Mutex::new(Some(task))),
    })
}

impl RaftHandle {
    /// The advertised raft address
    pub fn local(&self) -> &Server {
        &self.local
    }

    /// Stop the worker and wait for it to exit. Pending waiters fail.
    pub async fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown).await;
        if let Some(task) = self.worker.lock().await.take() {
            let _ = task.await;
        }
    }

    fn read_status<T>(&self, f: impl FnOnce(&Status) -> T) -> T {
        let guard = self.status.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    async fn submit(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| Error::Apply("raft is shutdown".into()))
    }
}

impl Consensus for RaftHandle {
    fn state(&self) -> RaftState {
        self.read_status(|s| s.state)
    }

    async fn apply(&self, command: Vec<u8>, timeout: Duration) -> Result<Option<ApplyResponse>> {
        let (tx, rx) = oneshot::channel();
        let wait = async {
            self.submit(Request::Propose {
                data: command,
                respond_to: tx,
            })
            .await?;
            rx.await
                .map_err(|_| Error::Apply("raft is shutdown".into()))?
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::ApplyTimeout)?
    }

    async fn configuration(&self) -> Result<ClusterConfiguration> {
        let (tx, rx) = oneshot::channel();
        self.submit(Request::Configuration { respond_to: tx })
            .await
            .map_err(|_| Error::Internal("raft is shutdown".into()))?;
        rx.await
            .map_err(|_| Error::Internal("raft is shutdown".into()))
    }

    async fn add_voter(&self, id: String, address: String, timeout: Duration) -> Result<()> {
        self.change_membership(Server { id, address }, false, timeout)
            .await
    }

    async fn remove_server(&self, id: String, timeout: Duration) -> Result<()> {
        let server = Server {
            id,
            address: String::new(),
        };
        self.change_membership(server, true, timeout).await
    }

    fn stats(&self) -> BTreeMap<String, String> {
        self.read_status(|s| s.stats.clone())
    }
}

impl RaftHandle {
    async fn change_membership(
        &self,
        server: Server,
        removed: bool,
        timeout: Duration,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let wait = async {
            self.submit(Request::Membership {
                server,
                removed,
                respond_to: tx,
            })
            .await?;
            rx.await
                .map_err(|_| Error::Apply("raft is shutdown".into()))?
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::ApplyTimeout)?
    }
}

struct Worker {
    node: RaftNode,
    transport: Transport,
    /// Known names and addresses, keyed by raft ID
    directory: HashMap<u64, Server>,
    pending: HashMap<u64, ApplyWaiter>,
    pending_membership: HashMap<u64, MembershipWaiter>,
    next_request: u64,
    status: Arc<RwLock<Status>>,
    last_role: StateRole,
}

impl Worker {
    fn new(node: RaftNode, local: Server, status: Arc<RwLock<Status>>) -> Self {
        let mut directory = HashMap::new();
        directory.insert(node.id(), local.clone());
        let last_role = node.role();
        Self {
            node,
            transport: Transport::new(local),
            directory,
            pending: HashMap::new(),
            pending_membership: HashMap::new(),
            // Random start keeps IDs from a previous run of this node from
            // matching new waiters.
            next_request: rand::random::<u64>() >> 1,
            status,
            last_role,
        }
    }

    async fn run(
        &mut self,
        mut requests: mpsc::Receiver<Request>,
        mut inbound: mpsc::Receiver<Inbound>,
        tick_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                req = requests.recv() => match req {
                    Some(Request::Shutdown) | None => break,
                    Some(req) => self.handle_request(req),
                },
                Some(msg) = inbound.recv() => self.handle_inbound(msg),
                _ = ticker.tick() => {
                    self.node.tick();
                    self.prune_pending();
                }
            }

            if let Err(e) = self.process_ready() {
                tracing::error!(node = self.node.id(), "Raft worker failed: {}", e);
                break;
            }
            self.observe_role();
            self.publish_status();
        }

        self.fail_pending(|| Error::Apply("raft is shutdown".into()));
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        status.state = RaftState::Shutdown;
        status.stats.insert("state".into(), RaftState::Shutdown.to_string());
        tracing::info!(node = self.node.id(), "Raft worker stopped");
    }

    fn next_request(&mut self) -> u64 {
        self.next_request = self.next_request.wrapping_add(1);
        self.next_request
    }

    fn handle_request(&mut self, req: Request) {
        match req {
            Request::Propose { data, respond_to } => {
                // Authoritative leadership check: the caller's pre-check may be stale
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(Error::NotLeader));
                    return;
                }
                let request = self.next_request();
                match self.node.propose(request, data) {
                    Ok(()) => {
                        self.pending.insert(request, respond_to);
                    }
                    Err(e) => {
                        let _ = respond_to.send(Err(Error::Apply(e.to_string())));
                    }
                }
            }
            Request::Membership {
                server,
                removed,
                respond_to,
            } => {
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(Error::NotLeader));
                    return;
                }
                if self.node.has_pending_conf() {
                    let _ = respond_to.send(Err(Error::Membership(
                        "another configuration change is in progress".into(),
                    )));
                    return;
                }
                if !removed {
                    // reachable before the change commits, so it can catch up
                    self.transport.set_peer(&server);
                }
                let request = self.next_request();
                match self.node.propose_membership(request, server, removed) {
                    Ok(()) => {
                        self.pending_membership.insert(request, respond_to);
                    }
                    Err(e) => {
                        let _ = respond_to.send(Err(Error::Membership(e.to_string())));
                    }
                }
            }
            Request::Configuration { respond_to } => {
                let _ = respond_to.send(self.configuration());
            }
            Request::Shutdown => {}
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let from = raft_id(&inbound.from.id);
        for server in inbound.members.iter().chain(std::iter::once(&inbound.from)) {
            self.learn(server);
        }
        if let Err(e) = self.node.step(inbound.message) {
            // Refused snapshots are already logged by the node
            tracing::debug!(from, "Dropped raft message: {}", e);
        }
    }

    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch(msg);
            }
            for applied in bundle.applied {
                match applied {
                    Applied::Command(report) => self.complete_apply(report),
                    Applied::Membership(report) => self.complete_membership(report),
                }
            }
        }
        Ok(())
    }

    /// Record a member's address and make it reachable.
    fn learn(&mut self, server: &Server) {
        let id = raft_id(&server.id);
        if id == self.node.id() || server.address.is_empty() {
            return;
        }
        if self.directory.get(&id) != Some(server) {
            self.transport.set_peer(server);
            self.directory.insert(id, server.clone());
        }
    }

    /// Send a message on its way. Failures only cost this message; raft
    /// retransmits.
    fn dispatch(&mut self, msg: Message) {
        let to = msg.to;
        let sent = if to == self.node.id() {
            self.node.step(msg)
        } else if msg.get_msg_type() == MessageType::MsgSnapshot {
            let members: Vec<Server> = self.directory.values().cloned().collect();
            self.transport.send(&msg, &members)
        } else {
            self.transport.send(&msg, &[])
        };
        if let Err(e) = sent {
            tracing::warn!(node = self.node.id(), to, "Dropped raft message: {}", e);
        }
    }

    fn complete_apply(&mut self, report: ApplyReport) {
        tracing::debug!(
            node = self.node.id(),
            index = report.index,
            term = report.term,
            "Applied log entry"
        );
        if let Some(waiter) = report.request.and_then(|r| self.pending.remove(&r)) {
            let _ = waiter.send(Ok(report.response));
        }
    }

    fn complete_membership(&mut self, report: MembershipReport) {
        let outcome = match report.result {
            Ok(()) => {
                if report.removed {
                    self.transport.remove_peer(report.raft_id);
                    if report.raft_id != self.node.id() {
                        self.directory.remove(&report.raft_id);
                    } else {
                        tracing::warn!(node = self.node.id(), "Removed from the cluster");
                    }
                } else if let Some(ctx) = &report.context {
                    self.learn(&ctx.server);
                }
                tracing::info!(
                    index = report.index,
                    member = report.raft_id,
                    removed = report.removed,
                    "Applied configuration change"
                );
                Ok(())
            }
            Err(e) => Err(Error::Membership(e)),
        };
        if let Some(waiter) = report.request.and_then(|r| self.pending_membership.remove(&r)) {
            let _ = waiter.send(outcome);
        }
    }

    /// Drop waiters whose caller timed out or went away
    fn prune_pending(&mut self) {
        self.pending.retain(|_, w| !w.is_closed());
        self.pending_membership.retain(|_, w| !w.is_closed());
    }

    fn fail_pending(&mut self, err: impl Fn() -> Error) {
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(err()));
        }
        for (_, waiter) in self.pending_membership.drain() {
            let _ = waiter.send(Err(err()));
        }
    }

    fn observe_role(&mut self) {
        let current = self.node.role();
        if current == self.last_role {
            return;
        }
        tracing::info!(
            node = self.node.id(),
            term = self.node.term(),
            leader = self.node.leader_id(),
            "Role changed {:?} -> {:?}",
            self.last_role,
            current
        );
        if self.last_role == StateRole::Leader {
            self.fail_pending(|| Error::NotLeader);
        }
        self.last_role = current;
    }

    fn server_for(&self, id: u64) -> Server {
        self.directory.get(&id).cloned().unwrap_or_else(|| Server {
            id: format!("{:016x}", id),
            address: self.transport.address_of(id).unwrap_or_default().to_string(),
        })
    }

    fn configuration(&self) -> ClusterConfiguration {
        let mut voters = self.node.voters().unwrap_or_default();
        voters.sort_unstable();
        ClusterConfiguration {
            servers: voters.into_iter().map(|id| self.server_for(id)).collect(),
        }
    }

    fn publish_status(&self) {
        let configuration = self.configuration();
        let leader = self.node.leader_id();
        let leader_name = if leader == 0 {
            String::new()
        } else {
            self.server_for(leader).id
        };

        let mut stats = BTreeMap::new();
        let mut put = |k: &str, v: String| {
            stats.insert(k.to_string(), v);
        };
        put("node_id", self.transport.local().id.clone());
        put("raft_id", self.node.id().to_string());
        put("state", RaftState::from(self.node.role()).to_string());
        put("term", self.node.term().to_string());
        put("leader_id", leader_name);
        put("commit_index", self.node.commit_index().to_string());
        put("applied_index", self.node.applied_index().to_string());
        put(
            "last_log_index",
            self.node.last_log_index().unwrap_or_default().to_string(),
        );
        put(
            "first_log_index",
            self.node.first_log_index().unwrap_or_default().to_string(),
        );
        put(
            "last_snapshot_index",
            self.node.last_snapshot_index().to_string(),
        );
        put(
            "num_peers",
            configuration.servers.len().saturating_sub(1).to_string(),
        );
        put("latest_configuration", configuration.to_string());

        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        status.state = RaftState::from(self.node.role());
        status.stats = stats;
    }
}
