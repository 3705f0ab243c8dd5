//! Request-facing roster operations.
//!
//! Writes go through the replicated log: leadership check, a read of the
//! L1/L2 records the command depends on, correlation token, submit, then wait
//! for the business outcome delivered by apply. Reads are served locally from
//! the tiered store.

use std::sync::Arc;
use std::time::Duration;

use crate::command::{Command, Envelope};
use crate::correlation::Registry;
use crate::entity::{Entity, EntityPatch};
use crate::error::{Error, Result};
use crate::membership;
use crate::metrics;
use crate::raft::ConsensusEngine;
use crate::state_machine::RosterStateMachine;
use crate::store::TieredStore;

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Bound on the log commit of one command.
    pub commit: Duration,
    /// Bound on the whole round trip, commit included.
    pub total: Duration,
}

pub struct RosterService {
    engine: Arc<dyn ConsensusEngine>,
    registry: Arc<Registry>,
    store: Arc<TieredStore>,
    state_machine: Arc<RosterStateMachine>,
    timeouts: Timeouts,
}

fn require_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::Invalid("id is required".to_string()));
    }
    Ok(())
}

impl RosterService {
    pub fn new(
        engine: Arc<dyn ConsensusEngine>,
        registry: Arc<Registry>,
        store: Arc<TieredStore>,
        state_machine: Arc<RosterStateMachine>,
        timeouts: Timeouts,
    ) -> Self {
        RosterService {
            engine,
            registry,
            store,
            state_machine,
            timeouts,
        }
    }

    pub fn engine(&self) -> &dyn ConsensusEngine {
        self.engine.as_ref()
    }

    pub async fn create_entity(&self, entity: Entity) -> Result<()> {
        metrics::record("create", async {
            entity.validate().map_err(Error::Invalid)?;
            self.submit(Command::Create(entity)).await
        })
        .await
    }

    pub async fn get_entity(&self, id: &str) -> Result<Entity> {
        metrics::record("get", async {
            self.state_machine.health()?;
            require_id(id)?;
            self.store.get(id).await
        })
        .await
    }

    pub async fn update_entity(&self, id: &str, patch: EntityPatch) -> Result<()> {
        metrics::record("update", async {
            require_id(id)?;
            if patch.is_empty() {
                return Err(Error::Invalid("nothing to update".to_string()));
            }
            self.submit(Command::Update {
                id: id.to_string(),
                patch,
            })
            .await
        })
        .await
    }

    pub async fn delete_entity(&self, id: &str) -> Result<()> {
        metrics::record("delete", async {
            require_id(id)?;
            self.submit(Command::Delete { id: id.to_string() }).await
        })
        .await
    }

    pub async fn join(&self, peer_id: &str, peer_addr: &str) -> Result<()> {
        metrics::record(
            "join",
            membership::join(self.engine.as_ref(), peer_id, peer_addr),
        )
        .await
    }

    /// Replicates `command` and waits for the outcome of applying it here.
    async fn submit(&self, command: Command) -> Result<()> {
        self.state_machine.health()?;
        membership::check_leadership_or_redirect(self.engine.as_ref())?;
        let tiers = self.store.tier_view(&command.touched_ids()).await?;

        let handle = self.registry.create_token();
        let token = handle.id();
        let data = match Envelope::new(token, command).with_tiers(tiers).encode() {
            Ok(data) => data,
            Err(e) => {
                self.registry.expire(token);
                return Err(e);
            }
        };
        let commit = match self.engine.submit(data).await {
            Ok(commit) => commit,
            Err(e) => {
                self.registry.expire(token);
                return Err(e.into());
            }
        };
        self.registry
            .await_result(handle, commit, self.timeouts.commit, self.timeouts.total)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::StateMachine;
    use crate::store::memory::{MemoryCache, MemoryStore};
    use crate::testkit::{ScriptedCluster, ScriptedEngine};
    use std::collections::HashMap;

    const LEADER: &str = "node1:127.0.0.1:7070";
    const FOLLOWER: &str = "node2:127.0.0.1:7071";

    struct Replica {
        service: Arc<RosterService>,
        registry: Arc<Registry>,
        state_machine: Arc<RosterStateMachine>,
    }

    fn timeouts(total: Duration) -> Timeouts {
        Timeouts {
            commit: Duration::from_secs(10),
            total,
        }
    }

    /// One node: its own L0 and registry, shared L1/L2.
    fn replica(
        cluster: &ScriptedCluster,
        engine: Arc<ScriptedEngine>,
        cache: Arc<MemoryCache>,
        durable: Arc<MemoryStore>,
        timeouts: Timeouts,
    ) -> Replica {
        let store = Arc::new(TieredStore::new(
            cache,
            durable,
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));
        let registry = Arc::new(Registry::new(4, Duration::from_secs(60)));
        let state_machine = Arc::new(RosterStateMachine::new(store.clone(), registry.clone()));
        cluster.add_replica(state_machine.clone() as Arc<dyn StateMachine>);
        let service = Arc::new(RosterService::new(
            engine,
            registry.clone(),
            store,
            state_machine.clone(),
            timeouts,
        ));
        Replica {
            service,
            registry,
            state_machine,
        }
    }

    fn leader_only(total: Duration) -> (ScriptedCluster, Replica) {
        let cluster = ScriptedCluster::new();
        let engine = cluster.node(LEADER);
        cluster.elect(LEADER);
        let node = replica(
            &cluster,
            engine,
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryStore::new()),
            timeouts(total),
        );
        (cluster, node)
    }

    fn two_nodes() -> (ScriptedCluster, Replica, Replica) {
        let cache = Arc::new(MemoryCache::new());
        two_nodes_with(cache.clone(), cache, Arc::new(MemoryStore::new()))
    }

    /// Leader and follower over the same L2, each with the given L1 client.
    fn two_nodes_with(
        leader_cache: Arc<MemoryCache>,
        follower_cache: Arc<MemoryCache>,
        durable: Arc<MemoryStore>,
    ) -> (ScriptedCluster, Replica, Replica) {
        let cluster = ScriptedCluster::new();
        let leader = replica(
            &cluster,
            cluster.node(LEADER),
            leader_cache,
            durable.clone(),
            timeouts(Duration::from_secs(5)),
        );
        let follower = replica(
            &cluster,
            cluster.node(FOLLOWER),
            follower_cache,
            durable,
            timeouts(Duration::from_secs(5)),
        );
        cluster.elect(LEADER);
        (cluster, leader, follower)
    }

    async fn snapshot_of(replica: &Replica) -> Vec<u8> {
        let snapshot = replica.state_machine.snapshot().await;
        let mut bytes = Vec::new();
        snapshot.persist(&mut bytes).unwrap();
        bytes
    }

    #[tokio::test]
    async fn test_crud_round_trip() {
        let (_cluster, node) = leader_only(Duration::from_secs(5));
        let svc = &node.service;

        svc.create_entity(Entity::new("s1", "Alice", 20)).await.unwrap();
        assert_eq!(svc.get_entity("s1").await.unwrap(), Entity::new("s1", "Alice", 20));

        svc.update_entity("s1", EntityPatch::name("Bob")).await.unwrap();
        assert_eq!(svc.get_entity("s1").await.unwrap(), Entity::new("s1", "Bob", 20));

        svc.delete_entity("s1").await.unwrap();
        assert!(matches!(svc.get_entity("s1").await, Err(Error::Deleted(_))));
        assert!(matches!(svc.get_entity("s2").await, Err(Error::NotFound(_))));
        assert!(node.registry.pending() == 0);
    }

    #[tokio::test]
    async fn test_domain_errors_reach_the_caller() {
        let (_cluster, node) = leader_only(Duration::from_secs(5));
        let svc = &node.service;
        svc.create_entity(Entity::new("s1", "Alice", 20)).await.unwrap();

        let dup = svc.create_entity(Entity::new("s1", "Alice", 20)).await;
        assert!(matches!(dup, Err(Error::AlreadyExists(_))));
        let missing = svc.update_entity("ghost", EntityPatch::name("X")).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_requests_are_not_submitted() {
        let (_cluster, node) = leader_only(Duration::from_secs(5));
        let svc = &node.service;
        assert!(matches!(
            svc.create_entity(Entity::new("", "Alice", 20)).await,
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            svc.create_entity(Entity::new("s1", "", 20)).await,
            Err(Error::Invalid(_))
        ));
        assert!(matches!(svc.delete_entity("").await, Err(Error::Invalid(_))));
        assert!(matches!(
            svc.update_entity("s1", EntityPatch::default()).await,
            Err(Error::Invalid(_))
        ));
        assert!(matches!(svc.get_entity("").await, Err(Error::Invalid(_))));
        assert!(node.registry.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_submissions_get_their_own_outcomes() {
        let (_cluster, node) = leader_only(Duration::from_secs(5));
        node.service
            .create_entity(Entity::new("taken", "T", 1))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for n in 0..32 {
            let svc = node.service.clone();
            tasks.push(tokio::spawn(async move {
                // Even callers collide with an existing id, odd ones create a fresh one.
                let id = if n % 2 == 0 {
                    "taken".to_string()
                } else {
                    format!("s{}", n)
                };
                (n, svc.create_entity(Entity::new(id, "Name", n)).await)
            }));
        }
        for task in tasks {
            let (n, res) = task.await.unwrap();
            if n % 2 == 0 {
                assert!(matches!(res, Err(Error::AlreadyExists(ref id)) if id == "taken"));
            } else {
                assert!(res.is_ok(), "caller {} got {:?}", n, res);
            }
        }
        assert_eq!(node.registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_uncommitted_submission_times_out_and_is_reclaimed() {
        let (cluster, node) = leader_only(Duration::from_millis(50));
        cluster.stall(true);

        for n in 0..20 {
            let res = node
                .service
                .create_entity(Entity::new(format!("s{}", n), "Name", 1))
                .await;
            assert!(matches!(res, Err(Error::Timeout)));
        }
        assert_eq!(node.registry.pending(), 0);
        node.registry.sweep_all();
        assert!(node.registry.is_empty());

        cluster.stall(false);
        node.service
            .create_entity(Entity::new("s0", "Name", 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_leader_is_retryable() {
        let (cluster, node) = leader_only(Duration::from_secs(5));
        cluster.depose();
        let err = node
            .service
            .create_entity(Entity::new("s1", "Alice", 20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoLeader));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_redirect_round_trip() {
        let (_cluster, leader, follower) = two_nodes();
        let nodes: HashMap<&str, &Replica> =
            [("127.0.0.1:7070", &leader), ("127.0.0.1:7071", &follower)].into();

        let request = Entity::new("s1", "Alice", 20);
        let err = follower
            .service
            .create_entity(request.clone())
            .await
            .unwrap_err();
        let Error::Redirect { leader_addr } = err else {
            panic!("expected a redirect, got {:?}", err);
        };
        assert_eq!(leader_addr, "127.0.0.1:7070");

        nodes[leader_addr.as_str()]
            .service
            .create_entity(request.clone())
            .await
            .unwrap();
        assert_eq!(leader.service.get_entity("s1").await.unwrap(), request);
        assert_eq!(follower.service.get_entity("s1").await.unwrap(), request);
        assert_eq!(follower.registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_replicas_converge() {
        let (_cluster, leader, follower) = two_nodes();
        let svc = &leader.service;
        svc.create_entity(Entity::new("s1", "Alice", 20)).await.unwrap();
        svc.create_entity(Entity::new("s2", "Carol", 30)).await.unwrap();
        svc.update_entity("s1", EntityPatch::name("Bob")).await.unwrap();
        svc.delete_entity("s2").await.unwrap();

        assert_eq!(snapshot_of(&leader).await, snapshot_of(&follower).await);
    }

    #[tokio::test]
    async fn test_replicas_converge_when_a_follower_tier_fails() {
        let follower_cache = Arc::new(MemoryCache::new());
        let durable = Arc::new(MemoryStore::new());
        durable.insert(Entity::new("old", "Legacy", 50));
        let (_cluster, leader, follower) =
            two_nodes_with(Arc::new(MemoryCache::new()), follower_cache.clone(), durable.clone());
        follower_cache.set_unavailable(true);

        let svc = &leader.service;
        svc.create_entity(Entity::new("s1", "Alice", 20)).await.unwrap();
        svc.update_entity("s1", EntityPatch::name("Bob")).await.unwrap();
        svc.update_entity("old", EntityPatch::name("Renamed")).await.unwrap();
        assert!(matches!(
            svc.create_entity(Entity::new("old", "Clash", 1)).await,
            Err(Error::AlreadyExists(_))
        ));

        assert_eq!(snapshot_of(&leader).await, snapshot_of(&follower).await);
        assert_eq!(durable.row("old").unwrap().name, "Renamed");
        assert_eq!(follower.registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_leader_tier_failure_submits_nothing() {
        let leader_cache = Arc::new(MemoryCache::new());
        let (_cluster, leader, follower) = two_nodes_with(
            leader_cache.clone(),
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryStore::new()),
        );
        leader_cache.set_unavailable(true);

        let err = leader
            .service
            .create_entity(Entity::new("s1", "Alice", 20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tier(_)));
        assert!(leader.registry.is_empty());
        assert_eq!(snapshot_of(&leader).await, snapshot_of(&follower).await);
        assert!(matches!(
            follower.service.get_entity("s1").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_node_refuses_service() {
        let (_cluster, node) = leader_only(Duration::from_secs(5));
        assert!(node
            .state_machine
            .restore(&mut &b"not a snapshot"[..])
            .await
            .is_err());

        assert!(matches!(
            node.service.get_entity("s1").await,
            Err(Error::Unavailable(_))
        ));
        assert!(matches!(
            node.service.create_entity(Entity::new("s1", "A", 1)).await,
            Err(Error::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_join_through_service() {
        let (cluster, node) = leader_only(Duration::from_secs(5));
        node.service
            .join(FOLLOWER, "10.0.0.2:8080")
            .await
            .unwrap();
        assert_eq!(cluster.membership_calls(), vec![format!("add {}", FOLLOWER)]);
        assert_eq!(node.service.engine().configuration().await.unwrap().len(), 2);
    }
}
