use super::*;
use proptest::prelude::*;
use std::collections::HashSet;

fn agent(id: &str) -> AgentId {
    AgentId::from(id)
}

fn workflow() -> WorkflowId {
    WorkflowId::from("w1")
}

#[tokio::test]
async fn test_two_agent_barrier_releases_both() {
    let coordinator = MultiAgentCoordinator::default();
    coordinator.open_point(&workflow(), "handover", 2).unwrap();

    let first = coordinator.arrive("handover", &agent("a1")).unwrap();
    let Arrival::Waiting(wait) = first else {
        panic!("barrier must stay closed after one arrival");
    };
    assert_eq!(
        coordinator.point("handover").unwrap().arrived,
        vec![agent("a1")]
    );

    let second = coordinator.arrive("handover", &agent("a2")).unwrap();
    let Arrival::Released(release) = second else {
        panic!("second arrival must release");
    };
    assert_eq!(release.participants, vec![agent("a1"), agent("a2")]);
    assert_eq!(release.phase, 1);

    let released = wait.wait().await.unwrap();
    assert_eq!(released, release);

    let point = coordinator.point("handover").unwrap();
    assert!(point.arrived.is_empty());
    assert_eq!(point.releases, 1);
    assert!(point.waiting_since.is_none());
}

#[test]
fn test_rearrival_does_not_double_count() {
    let coordinator = MultiAgentCoordinator::default();
    coordinator.open_point(&workflow(), "p", 2).unwrap();

    assert!(!coordinator.arrive("p", &agent("a1")).unwrap().is_released());
    assert!(!coordinator.arrive("p", &agent("a1")).unwrap().is_released());
    assert_eq!(coordinator.point("p").unwrap().arrived.len(), 1);
    assert!(coordinator.arrive("p", &agent("a2")).unwrap().is_released());
}

#[test]
fn test_open_point_validation() {
    let coordinator = MultiAgentCoordinator::default();
    assert!(coordinator.open_point(&workflow(), "p", 0).is_err());
    coordinator.open_point(&workflow(), "p", 2).unwrap();
    coordinator.open_point(&workflow(), "p", 2).unwrap();
    assert!(coordinator.open_point(&workflow(), "p", 3).is_err());
    assert!(coordinator.arrive("missing", &agent("a1")).is_err());
}

#[tokio::test]
async fn test_close_point_fails_waiters() {
    let coordinator = MultiAgentCoordinator::default();
    coordinator.open_point(&workflow(), "p", 2).unwrap();
    let Arrival::Waiting(wait) = coordinator.arrive("p", &agent("a1")).unwrap() else {
        panic!("expected waiting");
    };
    assert!(coordinator.close_point("p"));
    assert!(!coordinator.close_point("p"));
    assert!(matches!(
        wait.wait().await,
        Err(WorkflowError::Validation { .. })
    ));
}

#[test]
fn test_close_workflow_only_touches_its_points() {
    let coordinator = MultiAgentCoordinator::default();
    coordinator.open_point(&workflow(), "w1/a", 2).unwrap();
    coordinator.open_point(&workflow(), "w1/b", 2).unwrap();
    coordinator
        .open_point(&WorkflowId::from("w2"), "w2/a", 2)
        .unwrap();

    assert_eq!(coordinator.points_for(&workflow()).len(), 2);
    assert_eq!(coordinator.close_workflow(&workflow()), 2);
    assert!(coordinator.point("w2/a").is_some());
}

#[test]
fn test_leader_follower_is_default() {
    let coordinator = MultiAgentCoordinator::default();
    coordinator.open_point(&workflow(), "p", 2).unwrap();
    coordinator.arrive("p", &agent("a2")).unwrap();
    let Arrival::Released(release) = coordinator.arrive("p", &agent("a1")).unwrap() else {
        panic!("expected release");
    };
    assert_eq!(release.protocol, CoordinationProtocol::LeaderFollower);
    assert_eq!(
        release.directive_for(&agent("a2")).unwrap().role,
        ProceedRole::Leader
    );
    assert_eq!(
        release.directive_for(&agent("a1")).unwrap().role,
        ProceedRole::Follower {
            leader: agent("a2")
        }
    );
}

#[test]
fn test_auction_picks_highest_bid() {
    let coordinator = MultiAgentCoordinator::default();
    coordinator.configure_workflow(&workflow(), CoordinationProtocol::AuctionBased);
    coordinator.open_point(&workflow(), "p", 3).unwrap();
    coordinator.arrive_with_bid("p", &agent("a1"), 0.4).unwrap();
    coordinator.arrive_with_bid("p", &agent("a2"), 0.9).unwrap();
    assert!(coordinator
        .arrive_with_bid("p", &agent("a3"), f64::NAN)
        .is_err());
    let Arrival::Released(release) = coordinator.arrive("p", &agent("a3")).unwrap() else {
        panic!("expected release");
    };
    let order: Vec<_> = release
        .directives
        .iter()
        .map(|d| d.agent_id.as_str().to_string())
        .collect();
    assert_eq!(order, vec!["a2", "a1", "a3"]);
    assert_eq!(release.directives[0].role, ProceedRole::Winner);
}

#[test]
fn test_consensus_and_hierarchical_directives() {
    let arrivals = vec![agent("b"), agent("a"), agent("c")];
    let bids = HashMap::new();

    let consensus = CoordinationProtocol::Consensus.directives(&arrivals, &bids);
    assert!(consensus
        .iter()
        .all(|d| d.role == ProceedRole::Peer && d.order == 0));

    let hierarchy = CoordinationProtocol::Hierarchical.directives(&arrivals, &bids);
    assert_eq!(hierarchy[0].agent_id, agent("a"));
    assert_eq!(hierarchy[0].role, ProceedRole::Supervisor);
    assert!(hierarchy[1..].iter().all(|d| d.role
        == ProceedRole::Subordinate {
            supervisor: agent("a")
        }));
}

#[test]
fn test_stalled_reports_once_per_phase() {
    let coordinator = MultiAgentCoordinator::default();
    coordinator.open_point(&workflow(), "idle", 2).unwrap();
    coordinator.open_point(&workflow(), "busy", 2).unwrap();
    coordinator.arrive("busy", &agent("a1")).unwrap();

    let stalled = coordinator.stalled(Duration::ZERO);
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].point_id, "busy");
    assert_eq!(stalled[0].arrived, vec![agent("a1")]);
    assert!(coordinator.stalled(Duration::ZERO).is_empty());

    coordinator.arrive("busy", &agent("a2")).unwrap();
    coordinator.arrive("busy", &agent("a3")).unwrap();
    assert_eq!(coordinator.stalled(Duration::ZERO).len(), 1);
    assert!(coordinator.stalled(Duration::from_secs(3600)).is_empty());
}

proptest! {
    #[test]
    fn prop_barrier_releases_iff_required_distinct_arrivals(
        required in 1usize..5,
        arrivals in prop::collection::vec(0u8..6, 1..40),
    ) {
        let coordinator = MultiAgentCoordinator::default();
        coordinator.open_point(&workflow(), "p", required).unwrap();

        let mut model: HashSet<u8> = HashSet::new();
        let mut releases = 0u64;
        for id in arrivals {
            model.insert(id);
            let outcome = coordinator
                .arrive("p", &AgentId::from(format!("a{id}")))
                .unwrap();
            let expect_release = model.len() >= required;
            prop_assert_eq!(outcome.is_released(), expect_release);
            if expect_release {
                releases += 1;
                if let Arrival::Released(release) = outcome {
                    prop_assert_eq!(release.participants.len(), model.len());
                    prop_assert_eq!(release.phase, releases);
                }
                model.clear();
            }
            prop_assert_eq!(coordinator.point("p").unwrap().arrived.len(), model.len());
        }
    }
}
