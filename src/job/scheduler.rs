use crate::comm::fabric::Rank;
use crate::data::{Application, JobRequest};
use crate::job::tree::{JobTree, Side};

/// A decision of the local scheduler, executed by the worker loop (the
/// scheduler itself never sends).
#[derive(Debug)]
pub enum SchedulerAction {
    /// Dispatch a targeted rejoin request directly to a dormant rank.
    TargetedRejoin { dest: Rank, request: JobRequest },
    /// Dispatch a normal request into bounce routing.
    NormalRequest { request: JobRequest },
    /// Tell a dormant holder it will not be reactivated in this epoch.
    ReleaseFromWaiting { dest: Rank, epoch: i32 },
}

#[derive(Debug)]
struct Reservation {
    epoch: i32,
    index: i32,
    targeted_rank: Option<Rank>,
}

/// Reactivation-based per-job scheduler.
///
/// When enabled, a side that was previously occupied is never filled by a
/// fresh bounced request if a targeted rejoin can reach the old holder
/// instead: children are reserved across balancing epochs and released
/// explicitly when the volume drops.
#[derive(Debug)]
pub struct LocalScheduler {
    job_id: i32,
    application: Application,
    reservations: [Option<Reservation>; 2],
}

impl LocalScheduler {
    pub fn new(job_id: i32, application: Application) -> Self {
        Self {
            job_id,
            application,
            reservations: [None, None],
        }
    }

    fn make_request(
        &self,
        tree: &JobTree,
        my_rank: Rank,
        index: i32,
        epoch: i32,
        now: f32,
        desired_revision: i32,
    ) -> JobRequest {
        let mut req = JobRequest::new(
            self.job_id,
            self.application,
            tree.root_rank(),
            my_rank,
            index,
            now,
            epoch,
            0,
        );
        req.current_revision = desired_revision.max(0);
        req
    }

    /// Ranks that must not be targeted: current children and ranks already
    /// reserved for the other side.
    fn excluded_ranks(&self, tree: &JobTree) -> Vec<Rank> {
        let mut exclude: Vec<Rank> = Side::BOTH
            .into_iter()
            .filter_map(|side| tree.child_rank(side))
            .collect();
        exclude.extend(
            self.reservations
                .iter()
                .flatten()
                .filter_map(|r| r.targeted_rank),
        );
        exclude
    }

    /// Reacts to a balancing update `(epoch, volume)`: reserves and fills
    /// growing sides, cancels reservations of shrinking ones.
    pub fn update_balancing(
        &mut self,
        tree: &mut JobTree,
        epoch: i32,
        volume: i32,
        my_rank: Rank,
        now: f32,
        desired_revision: i32,
    ) -> Vec<SchedulerAction> {
        let mut actions = Vec::new();
        let mut cancelled = false;

        for side in Side::BOTH {
            let index = tree.child_index(side);
            if index < volume && !tree.has_child(side) {
                let already_reserved = matches!(
                    &self.reservations[side.idx()],
                    Some(r) if r.epoch >= epoch && r.index == index
                );
                if already_reserved {
                    continue;
                }
                let request = self.make_request(tree, my_rank, index, epoch, now, desired_revision);
                let exclude = self.excluded_ranks(tree);
                tree.set_desire(side, now);
                match tree.next_dormant_child(&exclude) {
                    Some(dormant) => {
                        self.reservations[side.idx()] = Some(Reservation {
                            epoch,
                            index,
                            targeted_rank: Some(dormant),
                        });
                        actions.push(SchedulerAction::TargetedRejoin {
                            dest: dormant,
                            request,
                        });
                    }
                    None => {
                        self.reservations[side.idx()] = Some(Reservation {
                            epoch,
                            index,
                            targeted_rank: None,
                        });
                        actions.push(SchedulerAction::NormalRequest { request });
                    }
                }
            } else if index >= volume {
                if self.reservations[side.idx()].take().is_some() {
                    cancelled = true;
                }
                tree.unset_desire(side);
            }
        }

        if cancelled {
            // Any dormant holder may be waiting for a rejoin that will not
            // come in this epoch.
            for dormant in tree.dormant_children() {
                actions.push(SchedulerAction::ReleaseFromWaiting {
                    dest: dormant,
                    epoch,
                });
            }
        }
        actions
    }

    /// Whether an offer to fill `index` is still acceptable.
    pub fn accepts_child(&self, tree: &JobTree, volume: i32, index: i32) -> bool {
        match tree.side_of_index(index) {
            Some(side) => index < volume && !tree.has_child(side),
            None => false,
        }
    }

    /// A child settled into `index`; its reservation is spent.
    pub fn handle_child_joining(&mut self, tree: &JobTree, _rank: Rank, _epoch: i32, index: i32) {
        if let Some(side) = tree.side_of_index(index) {
            self.reservations[side.idx()] = None;
        }
    }

    /// A targeted rejoin was declined. Updates the dormant cache and, if the
    /// side is still wanted, retries with the next dormant rank or falls back
    /// to a normal request.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_reject_reactivation(
        &mut self,
        tree: &mut JobTree,
        rank: Rank,
        epoch: i32,
        index: i32,
        child_still_dormant: bool,
        volume: i32,
        my_rank: Rank,
        now: f32,
        desired_revision: i32,
    ) -> Option<SchedulerAction> {
        if !child_still_dormant {
            tree.remove_dormant_child(rank);
        }
        let side = tree.side_of_index(index)?;

        let reservation_matches = matches!(
            &self.reservations[side.idx()],
            Some(r) if r.index == index && r.epoch <= epoch
        );
        if !reservation_matches {
            return None;
        }
        if index >= volume || tree.has_child(side) {
            self.reservations[side.idx()] = None;
            return None;
        }

        let request = self.make_request(tree, my_rank, index, epoch, now, desired_revision);
        let mut exclude = self.excluded_ranks(tree);
        exclude.push(rank);
        match tree.next_dormant_child(&exclude) {
            Some(dormant) => {
                self.reservations[side.idx()] = Some(Reservation {
                    epoch,
                    index,
                    targeted_rank: Some(dormant),
                });
                Some(SchedulerAction::TargetedRejoin {
                    dest: dormant,
                    request,
                })
            }
            None => {
                self.reservations[side.idx()] = Some(Reservation {
                    epoch,
                    index,
                    targeted_rank: None,
                });
                Some(SchedulerAction::NormalRequest { request })
            }
        }
    }
}
