//! End-to-end scheduling scenarios on a simulated cluster: tree growth,
//! shrinking, targeted rejoin and obsolescence handling.

mod test_harness;

use mallow::comm::tags;
use mallow::data::{Application, IntPair, JobRequest, Serializable};
use mallow::job::JobState;
use test_harness::TestCluster;

/// A single job growing from its root to volume 4: exactly three additional
/// workers become active at indices 1, 2, 3, and every non-root worker knows
/// the rank of its index's parent.
#[test]
fn test_single_job_growth_to_volume_4() {
    let mut cluster = TestCluster::new(5);
    let placement = cluster.grow_job(0, 1, Application::Sat, 4, 1);

    assert_eq!(placement.len(), 4);
    assert_eq!(cluster.active_indices(1), vec![0, 1, 2, 3]);

    // Distinct workers per node.
    let mut ranks: Vec<_> = placement.iter().map(|&(rank, _)| rank).collect();
    ranks.sort_unstable();
    ranks.dedup();
    assert_eq!(ranks.len(), 4);

    // Parent ranks are consistent with the index arithmetic.
    for &(rank, index) in &placement {
        if index == 0 {
            continue;
        }
        let parent_index = (index - 1) / 2;
        let parent_rank = cluster.rank_of_index(1, parent_index).unwrap();
        assert_eq!(
            cluster.worker(rank).job_parent_rank(1),
            Some(parent_rank),
            "index {index} should have the holder of index {parent_index} as parent"
        );
    }
}

/// Growth then shrink: indices 2 and 3 leave the active set, their parents
/// prune them into the dormant cache, and no live children remain at indices
/// beyond the volume.
#[test]
fn test_growth_then_shrink_to_volume_2() {
    let mut cluster = TestCluster::new(5);
    let placement = cluster.grow_job(0, 1, Application::Sat, 4, 1);
    let rank_of_2 = cluster.rank_of_index(1, 2).unwrap();
    let rank_of_3 = cluster.rank_of_index(1, 3).unwrap();
    let root_rank = cluster.rank_of_index(1, 0).unwrap();
    let rank_of_1 = cluster.rank_of_index(1, 1).unwrap();
    assert_eq!(placement.len(), 4);

    cluster.broadcast_volume(1, 2, 2);
    let shrunk = cluster.drive_until(1, 200, |c| c.active_indices(1) == vec![0, 1]);
    assert!(shrunk, "indices 2 and 3 did not suspend");
    // Let the leaving notifications reach the parents.
    cluster.drive(10);

    assert_eq!(cluster.worker(rank_of_2).job_state(1), Some(JobState::Suspended));
    assert_eq!(cluster.worker(rank_of_3).job_state(1), Some(JobState::Suspended));

    // The departed children are cached at their parents for later rejoin.
    assert!(cluster.worker(root_rank).job_dormant_children(1).contains(&rank_of_2));
    assert!(cluster.worker(rank_of_1).job_dormant_children(1).contains(&rank_of_3));

    // No live children at indices >= 2.
    let (left, _right) = cluster.worker(root_rank).job_children(1).unwrap();
    assert_eq!(left, Some(rank_of_1));
    let (_, root_right) = cluster.worker(root_rank).job_children(1).unwrap();
    assert_eq!(root_right, None);
    assert_eq!(cluster.worker(rank_of_1).job_children(1).unwrap(), (None, None));
}

/// Targeted rejoin: with reactivation scheduling, re-growing after a shrink
/// reactivates the same ranks at their previous indices instead of bouncing
/// fresh requests.
#[test]
fn test_targeted_rejoin_after_shrink() {
    let mut cluster = TestCluster::with_config(5, |cfg| {
        cfg.reactivation_scheduling = true;
    });
    cluster.grow_job(0, 1, Application::Sat, 4, 1);
    let rank_of_2 = cluster.rank_of_index(1, 2).unwrap();
    let rank_of_3 = cluster.rank_of_index(1, 3).unwrap();

    cluster.broadcast_volume(1, 2, 2);
    let shrunk = cluster.drive_until(1, 200, |c| c.active_indices(1) == vec![0, 1]);
    assert!(shrunk, "shrink did not settle");
    cluster.drive(10);

    cluster.broadcast_volume(1, 4, 3);
    let regrown = cluster.drive_until(1, 200, |c| c.active_indices(1) == vec![0, 1, 2, 3]);
    assert!(regrown, "tree did not regrow to volume 4");

    // The previous holders re-entered at their previous indices.
    assert_eq!(cluster.rank_of_index(1, 2), Some(rank_of_2));
    assert_eq!(cluster.rank_of_index(1, 3), Some(rank_of_3));
}

/// Volume convergence: once the balancer goes quiet, the active set is
/// exactly `volume` workers and stays that way.
#[test]
fn test_volume_convergence_when_balancer_stops() {
    let mut cluster = TestCluster::new(6);
    cluster.grow_job(0, 1, Application::Sat, 4, 1);

    cluster.drive(100);
    assert_eq!(cluster.active_indices(1), vec![0, 1, 2, 3]);
    for (rank, _) in cluster.ranks_in_state(1, JobState::Active) {
        assert_eq!(cluster.worker(rank).job_volume(1), Some(4));
    }

    let before = cluster.ranks_in_state(1, JobState::Active);
    cluster.drive(100);
    assert_eq!(before, cluster.ranks_in_state(1, JobState::Active));
}

/// An obsolete request (past epoch, index beyond the known volume) is dropped
/// by the first handler that sees it.
#[test]
fn test_obsolete_request_is_dropped() {
    let mut cluster = TestCluster::new(2);
    // Rank 1 learns epoch 2 with volume 2 for job 9.
    cluster.push_volume(1, 9, 2, 2);
    cluster.drive(4);

    let request = JobRequest::new(9, Application::Sat, 0, 0, 5, 0.0, 1, 3);
    cluster
        .worker(0)
        .send_message(1, tags::REQUEST_NODE, request.serialize());
    cluster.drive(10);

    assert!(!cluster.worker(1).has_commitment(9));
    assert_eq!(cluster.worker(1).job_state(9), None);
}

/// Requests from a future balancing epoch are stashed and replayed once the
/// epoch catches up.
#[test]
fn test_future_epoch_request_is_stashed_and_replayed() {
    let mut cluster = TestCluster::new(2);

    let request = JobRequest::new(5, Application::Sat, 0, 0, 1, 0.0, 3, 2);
    cluster
        .worker(0)
        .send_message(1, tags::REQUEST_NODE, request.serialize());
    cluster.drive(10);
    // Epoch 3 has not happened yet: no adoption.
    assert!(!cluster.worker(1).has_commitment(5));

    cluster.push_volume(1, 5, 4, 3);
    let adopted = cluster.drive_until(5, 50, |c| c.worker(1).has_commitment(5));
    assert!(adopted, "stashed request was not replayed at epoch 3");
}

/// An adoption answer arriving after the job shrank below the requested
/// index releases the commitment without activating the job.
#[test]
fn test_obsolete_adoption_answer_releases_commitment() {
    let mut cluster = TestCluster::new(2);
    // Rank 1 knows: job 9 has volume 3 as of epoch 1.
    cluster.push_volume(1, 9, 3, 1);
    cluster.drive(4);

    // A request for index 5 of the same epoch arrives and is adopted (the
    // volume only binds requests from older epochs).
    let request = JobRequest::new(9, Application::Sat, 0, 0, 5, 0.0, 1, 2);
    cluster
        .worker(0)
        .send_message(1, tags::REQUEST_NODE, request.serialize());
    cluster.step_worker(1);
    assert!(cluster.worker(1).has_commitment(9));

    // The accept answer arrives; rank 1 applies the known volume first,
    // detects index 5 >= volume 3, and backs out.
    cluster
        .worker(0)
        .send_message(1, tags::ANSWER_ADOPTION_OFFER, IntPair(9, 1).serialize());
    cluster.drive(10);

    assert!(!cluster.worker(1).has_commitment(9));
    assert_ne!(cluster.worker(1).job_state(9), Some(JobState::Active));
}

/// Explicit volume updates: parents push volume changes down the tree, and a
/// newly joined child still converges on the correct volume.
#[test]
fn test_growth_with_explicit_volume_updates() {
    let mut cluster = TestCluster::with_config(5, |cfg| {
        cfg.explicit_volume_updates = true;
    });
    cluster.grow_job(0, 1, Application::Sat, 4, 1);
    for (rank, _) in cluster.ranks_in_state(1, JobState::Active) {
        assert_eq!(cluster.worker(rank).job_volume(1), Some(4));
    }
}
