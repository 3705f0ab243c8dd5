//! Cluster admission and the leader-forwarding decision for writes.

use crate::error::{Error, Result};
use crate::raft::{ConsensusEngine, ConsensusError, Member};

/// Parts of a node identifier `name:host:port`; host and port are the node's
/// externally reachable API address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeName<'a> {
    pub name: &'a str,
    pub host: &'a str,
    pub port: u16,
}

impl<'a> NodeName<'a> {
    pub fn parse(id: &'a str) -> Result<Self> {
        let invalid = || Error::Invalid(format!("node id {:?} is not of the form name:host:port", id));
        let mut parts = id.splitn(3, ':');
        let (Some(name), Some(host), Some(port)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };
        if name.is_empty() || host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(NodeName { name, host, port })
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Proceeds on the leader. Anywhere else, answers with the leader's API
/// address, or `NoLeader` while there is none to name.
pub fn check_leadership_or_redirect(engine: &dyn ConsensusEngine) -> Result<()> {
    let leadership = engine.leader();
    if leadership.is_leader {
        return Ok(());
    }
    let Some(leader) = leadership.leader else {
        return Err(Error::NoLeader);
    };
    match NodeName::parse(&leader.id) {
        Ok(name) => Err(Error::Redirect {
            leader_addr: name.api_addr(),
        }),
        Err(e) => {
            log::warn!("cannot redirect to leader: {}", e);
            Err(Error::NoLeader)
        }
    }
}

/// Admits `peer_id` at `peer_addr` as a voter. Leader only.
///
/// Re-joining with the same id and address is a no-op. A peer the consensus
/// transport cannot reach is refused. A member that shares only the id or only
/// the address with the peer is removed first.
pub async fn join(engine: &dyn ConsensusEngine, peer_id: &str, peer_addr: &str) -> Result<()> {
    if peer_addr.is_empty() {
        return Err(Error::Invalid("peer address is required".to_string()));
    }
    NodeName::parse(peer_id)?;
    check_leadership_or_redirect(engine)?;

    let members = engine.configuration().await?;
    if members
        .iter()
        .any(|m| m.id == peer_id && m.address == peer_addr)
    {
        log::info!("node {} at {} is already a member", peer_id, peer_addr);
        return Ok(());
    }
    if !engine.reaches(peer_addr) {
        log::warn!("refusing to admit {}: nothing reaches {}", peer_id, peer_addr);
        return Err(ConsensusError::Unreachable(peer_addr.to_string()).into());
    }
    for stale in members
        .iter()
        .filter(|m| m.id == peer_id || m.address == peer_addr)
    {
        log::info!(
            "removing member {} at {} before admitting {} at {}",
            stale.id,
            stale.address,
            peer_id,
            peer_addr
        );
        engine.remove_server(&stale.id).await?;
    }

    engine
        .add_voter(Member::voter(peer_id, peer_addr))
        .await?;
    let admitted = engine
        .configuration()
        .await?
        .iter()
        .any(|m| m.id == peer_id && m.address == peer_addr);
    if !admitted {
        return Err(ConsensusError::Membership(format!(
            "{} is missing from the configuration after joining",
            peer_id
        ))
        .into());
    }
    log::info!("node {} at {} joined successfully", peer_id, peer_addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::ScriptedCluster;

    const LEADER: &str = "node1:127.0.0.1:7070";

    #[test]
    fn test_parse_node_id() {
        let name = NodeName::parse("node1:localhost:7070").unwrap();
        assert_eq!(name.name, "node1");
        assert_eq!(name.api_addr(), "localhost:7070");

        for bad in ["node1", "node1:localhost", "node1:localhost:port", ":h:1", "n::1"] {
            assert!(matches!(NodeName::parse(bad), Err(Error::Invalid(_))), "{}", bad);
        }
    }

    #[test]
    fn test_leader_proceeds() {
        let cluster = ScriptedCluster::new();
        let leader = cluster.node(LEADER);
        cluster.elect(LEADER);
        assert!(check_leadership_or_redirect(leader.as_ref()).is_ok());
    }

    #[test]
    fn test_follower_redirects_to_leader_api_address() {
        let cluster = ScriptedCluster::new();
        let follower = cluster.node("node2:127.0.0.1:7071");
        cluster.node(LEADER);
        cluster.elect(LEADER);

        let err = check_leadership_or_redirect(follower.as_ref()).unwrap_err();
        assert!(matches!(err, Error::Redirect { ref leader_addr } if leader_addr == "127.0.0.1:7070"));
    }

    #[test]
    fn test_no_leader_during_election() {
        let cluster = ScriptedCluster::new();
        let node = cluster.node(LEADER);
        assert!(matches!(
            check_leadership_or_redirect(node.as_ref()),
            Err(Error::NoLeader)
        ));
    }

    #[tokio::test]
    async fn test_join_adds_voter_once() {
        let cluster = ScriptedCluster::new();
        let leader = cluster.node(LEADER);
        cluster.elect(LEADER);

        join(leader.as_ref(), "node2:127.0.0.1:7071", "10.0.0.2:8080")
            .await
            .unwrap();
        join(leader.as_ref(), "node2:127.0.0.1:7071", "10.0.0.2:8080")
            .await
            .unwrap();

        let members = leader.configuration().await.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(cluster.membership_calls(), vec!["add node2:127.0.0.1:7071"]);
    }

    #[tokio::test]
    async fn test_join_replaces_conflicting_members() {
        let cluster = ScriptedCluster::new();
        let leader = cluster.node(LEADER);
        cluster.elect(LEADER);
        join(leader.as_ref(), "node2:127.0.0.1:7071", "10.0.0.2:8080")
            .await
            .unwrap();
        join(leader.as_ref(), "node3:127.0.0.1:7072", "10.0.0.3:8080")
            .await
            .unwrap();

        // Same id at a new address, and a new id at node3's address.
        join(leader.as_ref(), "node2:127.0.0.1:7071", "10.0.0.9:8080")
            .await
            .unwrap();
        join(leader.as_ref(), "node4:127.0.0.1:7074", "10.0.0.3:8080")
            .await
            .unwrap();

        let mut members: Vec<_> = leader
            .configuration()
            .await
            .unwrap()
            .into_iter()
            .map(|m| (m.id, m.address))
            .collect();
        members.sort();
        assert_eq!(
            members,
            vec![
                (LEADER.to_string(), "node1-raft".to_string()),
                ("node2:127.0.0.1:7071".to_string(), "10.0.0.9:8080".to_string()),
                ("node4:127.0.0.1:7074".to_string(), "10.0.0.3:8080".to_string()),
            ]
        );
        assert!(cluster
            .membership_calls()
            .contains(&"remove node3:127.0.0.1:7072".to_string()));
    }

    #[tokio::test]
    async fn test_join_refuses_unreachable_peer() {
        let cluster = ScriptedCluster::new();
        let leader = cluster.node(LEADER);
        cluster.elect(LEADER);
        cluster.sever("10.0.0.2:8080");

        let err = join(leader.as_ref(), "node2:127.0.0.1:7071", "10.0.0.2:8080")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Consensus(ConsensusError::Unreachable(ref addr)) if addr == "10.0.0.2:8080"
        ));
        assert!(cluster.membership_calls().is_empty());
        assert_eq!(leader.configuration().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_join_rejected_off_leader() {
        let cluster = ScriptedCluster::new();
        let follower = cluster.node("node2:127.0.0.1:7071");
        cluster.node(LEADER);
        cluster.elect(LEADER);

        let err = join(follower.as_ref(), "node3:127.0.0.1:7072", "10.0.0.3:8080")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Redirect { .. }));
        assert!(cluster.membership_calls().is_empty());
    }

    #[tokio::test]
    async fn test_join_validates_peer() {
        let cluster = ScriptedCluster::new();
        let leader = cluster.node(LEADER);
        cluster.elect(LEADER);
        assert!(matches!(
            join(leader.as_ref(), "bogus", "10.0.0.2:8080").await,
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            join(leader.as_ref(), "node2:127.0.0.1:7071", "").await,
            Err(Error::Invalid(_))
        ));
    }
}
