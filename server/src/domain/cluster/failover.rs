//! Leader-style failure detection and re-mastering.
//!
//! The leader sends a heartbeat to every peer each `heartbeat` interval and
//! counts acknowledgements; a follower missing `node_fail_after` beats is
//! declared down and the leader announces a new live set, which every node
//! uses to rebuild its ring and rehash its topics. A follower that misses
//! `vote_after` leader beats calls an election; the lowest-named live node
//! stands as candidate and wins on a majority of acks. Failover requires at
//! least three configured nodes.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use std::sync::Arc;

use super::{Cluster, ClusterFrame};

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub enabled: bool,
    pub heartbeat: Duration,
    /// Missed leader beats before a follower calls an election.
    pub vote_after: u32,
    /// Missed acks before the leader declares a follower down.
    pub node_fail_after: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node: String,
    pub term: u64,
    /// The leader's view of the live node set.
    pub live: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingAck {
    pub node: String,
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteReq {
    pub node: String,
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteAck {
    pub node: String,
    pub term: u64,
    pub granted: bool,
}

/// Mutable failover bookkeeping, guarded by the cluster's lock.
pub(crate) struct FailoverState {
    pub leader: Option<String>,
    pub term: u64,
    pub missed_leader_beats: u32,
    pub last_seen: HashMap<String, Instant>,
    pub votes: HashSet<String>,
    pub voted_in: u64,
}

impl FailoverState {
    pub fn new(nodes: &[String]) -> FailoverState {
        // Everyone starts by assuming the lowest-named node leads.
        let leader = nodes.iter().min().cloned();
        let now = Instant::now();
        FailoverState {
            leader,
            term: 0,
            missed_leader_beats: 0,
            last_seen: nodes.iter().map(|n| (n.clone(), now)).collect(),
            votes: HashSet::new(),
            voted_in: 0,
        }
    }
}

impl Cluster {
    pub fn leader(&self) -> Option<String> {
        self.fo.lock().leader.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.fo.lock().leader.as_deref() == Some(self.self_name())
    }

    /// Record traffic from a peer as liveness evidence.
    pub(crate) fn note_peer_alive(&self, node: &str) {
        self.fo.lock().last_seen.insert(node.to_string(), Instant::now());
    }

    pub(crate) fn spawn_failover(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let cluster = self.clone();
        let cfg = self.failover.clone().expect("failover config present");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cfg.heartbeat);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => cluster.failover_tick(&cfg).await,
                }
            }
        })
    }

    async fn failover_tick(self: &Arc<Self>, cfg: &FailoverConfig) {
        if self.is_leader() {
            self.leader_tick(cfg).await;
        } else {
            self.follower_tick(cfg).await;
        }
    }

    async fn leader_tick(self: &Arc<Self>, cfg: &FailoverConfig) {
        let fail_after = cfg.heartbeat * cfg.node_fail_after;
        let (term, live) = {
            let mut fo = self.fo.lock();
            fo.last_seen.insert(self.self_name().to_string(), Instant::now());
            let now = Instant::now();
            let live: Vec<String> = self
                .node_names()
                .iter()
                .filter(|n| {
                    fo.last_seen
                        .get(*n)
                        .map(|seen| now.duration_since(*seen) < fail_after)
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            (fo.term, live)
        };

        if self.set_live_nodes(&live) {
            tracing::info!(live = ?live, "cluster membership changed, rehashing");
            self.ctx().hub().rehash_topics();
        }

        let hb = Heartbeat {
            node: self.self_name().to_string(),
            term,
            live: live.clone(),
        };
        for node in self.node_names().to_vec() {
            if node == self.self_name() {
                continue;
            }
            if let Err(e) = self.send_frame(&node, &ClusterFrame::Ping(hb.clone())).await {
                tracing::debug!(node = %node, error = %e, "heartbeat failed");
            }
        }
    }

    async fn follower_tick(self: &Arc<Self>, cfg: &FailoverConfig) {
        let call_election = {
            let mut fo = self.fo.lock();
            fo.missed_leader_beats += 1;
            fo.missed_leader_beats >= cfg.vote_after
        };
        if !call_election {
            return;
        }

        // The leader went silent. The lowest-named node still believed
        // alive is the candidate; everyone else waits for its vote request.
        let fail_after = cfg.heartbeat * cfg.node_fail_after;
        let (candidate, term, dead_leader) = {
            let mut fo = self.fo.lock();
            let dead_leader = fo.leader.clone();
            let now = Instant::now();
            let candidate = self
                .node_names()
                .iter()
                .filter(|n| {
                    n.as_str() == self.self_name()
                        || (Some(n.as_str()) != dead_leader.as_deref()
                            && fo
                                .last_seen
                                .get(*n)
                                .map(|seen| now.duration_since(*seen) < fail_after)
                                .unwrap_or(false))
                })
                .min()
                .cloned();
            let term = fo.term + 1;
            if candidate.as_deref() == Some(self.self_name()) {
                fo.term = term;
                fo.voted_in = term;
                fo.votes = HashSet::from([self.self_name().to_string()]);
                fo.leader = None;
            }
            (candidate, term, dead_leader)
        };

        if candidate.as_deref() != Some(self.self_name()) {
            return;
        }
        tracing::info!(term, previous = ?dead_leader, "leader silent, calling election");
        let vote = VoteReq {
            node: self.self_name().to_string(),
            term,
        };
        for node in self.node_names().to_vec() {
            if node == self.self_name() {
                continue;
            }
            if let Err(e) = self.send_frame(&node, &ClusterFrame::Vote(vote.clone())).await {
                tracing::debug!(node = %node, error = %e, "vote request failed");
            }
        }
        // A single live node among three configured cannot win a majority;
        // the cluster stays leaderless until peers return.
        self.try_win_election(term).await;
    }

    pub(crate) async fn on_heartbeat(self: &Arc<Self>, hb: Heartbeat) {
        let accepted = {
            let mut fo = self.fo.lock();
            if hb.term < fo.term {
                false
            } else {
                fo.term = hb.term;
                fo.leader = Some(hb.node.clone());
                fo.missed_leader_beats = 0;
                fo.last_seen.insert(hb.node.clone(), Instant::now());
                true
            }
        };
        if !accepted {
            return;
        }
        if self.set_live_nodes(&hb.live) {
            tracing::info!(live = ?hb.live, leader = %hb.node, "adopting leader's live set");
            self.ctx().hub().rehash_topics();
        }
        let ack = PingAck {
            node: self.self_name().to_string(),
            term: hb.term,
        };
        if let Err(e) = self.send_frame(&hb.node, &ClusterFrame::PingAck(ack)).await {
            tracing::debug!(node = %hb.node, error = %e, "heartbeat ack failed");
        }
    }

    pub(crate) fn on_ping_ack(&self, ack: PingAck) {
        self.note_peer_alive(&ack.node);
    }

    pub(crate) async fn on_vote(self: &Arc<Self>, vote: VoteReq) {
        self.note_peer_alive(&vote.node);
        let granted = {
            let mut fo = self.fo.lock();
            if vote.term > fo.voted_in {
                fo.voted_in = vote.term;
                fo.missed_leader_beats = 0;
                true
            } else {
                false
            }
        };
        let ack = VoteAck {
            node: self.self_name().to_string(),
            term: vote.term,
            granted,
        };
        if let Err(e) = self.send_frame(&vote.node, &ClusterFrame::VoteAck(ack)).await {
            tracing::debug!(node = %vote.node, error = %e, "vote ack failed");
        }
    }

    pub(crate) async fn on_vote_ack(self: &Arc<Self>, ack: VoteAck) {
        self.note_peer_alive(&ack.node);
        if !ack.granted {
            return;
        }
        let term = {
            let mut fo = self.fo.lock();
            if ack.term != fo.term {
                return;
            }
            fo.votes.insert(ack.node.clone());
            fo.term
        };
        self.try_win_election(term).await;
    }

    /// Become leader once a majority of the configured nodes voted this
    /// term, then announce the new live set immediately.
    async fn try_win_election(self: &Arc<Self>, term: u64) {
        let won = {
            let mut fo = self.fo.lock();
            if fo.term != term || fo.leader.is_some() {
                return;
            }
            if fo.votes.len() * 2 <= self.node_names().len() {
                return;
            }
            fo.leader = Some(self.self_name().to_string());
            true
        };
        if won {
            tracing::info!(term, "election won, assuming leadership");
            if let Some(cfg) = self.failover.clone() {
                self.leader_tick(&cfg).await;
            }
        }
    }
}
