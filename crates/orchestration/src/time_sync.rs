//! The cooperative virtual-time barrier.
//!
//! A synchronized participant owns exactly one simulation task. Per tick it
//! runs the task, announces its next execution point to all peers, and
//! blocks until every synchronized peer's announced point has reached its
//! own. The virtual clock therefore advances to the minimum announced
//! `time_point` across the synchronized set; no participant observes a
//! frame timestamped beyond its own clock.

use cosim_messages::NextSimTask;
use cosim_types::{SimStep, SimTime};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

/// Inputs to the time coordinator.
#[derive(Debug, Clone)]
pub enum TimeSyncEvent {
    /// The lifecycle entered `Running`.
    Start,
    /// The simulation task finished (inline return or
    /// `CompleteSimulationStep`).
    StepCompleted,
    /// A peer announced its next execution point.
    PeerTask {
        participant_name: String,
        task: NextSimTask,
    },
    /// A synchronized peer's time-sync service was discovered.
    PeerJoined(String),
    /// A synchronized peer left the domain.
    PeerLeft(String),
    /// The lifecycle left `Running` (pause). Announcements are withheld
    /// until `Resume`.
    Pause,
    Resume,
    /// Stopping, Error, or Aborting: no further announcements are emitted.
    Stop,
}

/// Outputs of the time coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeSyncAction {
    /// Run the user's simulation task for `[now, now + duration)`.
    InvokeSimTask { now: SimTime, duration: SimStep },
    /// Broadcast our next execution point to all peers.
    SendNextSimTask(NextSimTask),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Before `Start`.
    Inactive,
    /// The simulation task is running (or pending async completion).
    Executing,
    /// Waiting for every peer to reach our announced point.
    WaitingForPeers,
    Paused,
    Stopped,
}

/// Virtual-time coordinator state machine. Synchronous and I/O-free.
pub struct TimeSyncState {
    step: SimStep,
    now: SimTime,
    phase: Phase,
    /// Our announced next execution point, once the first step completed.
    my_next: Option<NextSimTask>,
    /// Latest announcement per synchronized peer.
    peer_tasks: HashMap<String, NextSimTask>,
    /// The synchronized set, maintained from discovery events.
    sync_peers: BTreeSet<String>,
    /// Step finished while paused; announcement still owed.
    pending_announce: bool,
}

impl TimeSyncState {
    pub fn new(step: SimStep) -> Self {
        Self {
            step,
            now: SimTime::ZERO,
            phase: Phase::Inactive,
            my_next: None,
            peer_tasks: HashMap::new(),
            sync_peers: BTreeSet::new(),
            pending_announce: false,
        }
    }

    /// The participant's current virtual time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Configure the step size. Only meaningful before `Start`; the
    /// synchronized-peer set is preserved.
    pub fn set_step(&mut self, step: SimStep) {
        if self.phase == Phase::Inactive {
            self.step = step;
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Executing | Phase::WaitingForPeers)
    }

    pub fn handle(&mut self, event: TimeSyncEvent) -> Vec<TimeSyncAction> {
        match event {
            TimeSyncEvent::Start => self.on_start(),
            TimeSyncEvent::StepCompleted => self.on_step_completed(),
            TimeSyncEvent::PeerTask {
                participant_name,
                task,
            } => self.on_peer_task(participant_name, task),
            TimeSyncEvent::PeerJoined(name) => {
                trace!(peer = %name, "synchronized peer joined");
                self.sync_peers.insert(name);
                Vec::new()
            }
            TimeSyncEvent::PeerLeft(name) => {
                trace!(peer = %name, "synchronized peer left");
                self.sync_peers.remove(&name);
                self.peer_tasks.remove(&name);
                self.try_advance()
            }
            TimeSyncEvent::Pause => {
                if self.is_running() {
                    self.phase = Phase::Paused;
                }
                Vec::new()
            }
            TimeSyncEvent::Resume => self.on_resume(),
            TimeSyncEvent::Stop => {
                debug!(now = %self.now, "time sync stopped");
                self.phase = Phase::Stopped;
                Vec::new()
            }
        }
    }

    fn on_start(&mut self) -> Vec<TimeSyncAction> {
        if self.phase != Phase::Inactive {
            return Vec::new();
        }
        self.phase = Phase::Executing;
        debug!(step = %self.step, "time sync started");
        // The first tick runs immediately at t = 0.
        vec![TimeSyncAction::InvokeSimTask {
            now: self.now,
            duration: self.step,
        }]
    }

    fn on_step_completed(&mut self) -> Vec<TimeSyncAction> {
        match self.phase {
            Phase::Executing => {}
            Phase::Paused => {
                // Announce once resumed.
                self.pending_announce = true;
                return Vec::new();
            }
            // A pending async step finishing after cancellation is fine;
            // we just never announce again.
            _ => return Vec::new(),
        }

        let next = NextSimTask {
            time_point: self.now + self.step,
            duration: self.step,
        };
        self.my_next = Some(next);
        self.phase = Phase::WaitingForPeers;

        let mut actions = vec![TimeSyncAction::SendNextSimTask(next)];
        actions.extend(self.try_advance());
        actions
    }

    fn on_peer_task(&mut self, name: String, task: NextSimTask) -> Vec<TimeSyncAction> {
        // An announcement implies a synchronized peer, even if its service
        // discovery event has not arrived yet.
        self.sync_peers.insert(name.clone());
        self.peer_tasks.insert(name, task);
        self.try_advance()
    }

    fn on_resume(&mut self) -> Vec<TimeSyncAction> {
        if self.phase != Phase::Paused {
            return Vec::new();
        }
        if self.pending_announce {
            self.pending_announce = false;
            self.phase = Phase::Executing;
            return self.on_step_completed();
        }
        self.phase = if self.my_next.is_some() {
            Phase::WaitingForPeers
        } else {
            Phase::Executing
        };
        self.try_advance()
    }

    /// Release the barrier when every synchronized peer has announced a
    /// point at or beyond ours.
    fn try_advance(&mut self) -> Vec<TimeSyncAction> {
        if self.phase != Phase::WaitingForPeers {
            return Vec::new();
        }
        let Some(my_next) = self.my_next else {
            return Vec::new();
        };
        let all_reached = self.sync_peers.iter().all(|peer| {
            self.peer_tasks
                .get(peer)
                .is_some_and(|task| task.time_point >= my_next.time_point)
        });
        if !all_reached {
            return Vec::new();
        }

        self.now = my_next.time_point;
        self.phase = Phase::Executing;
        trace!(now = %self.now, "tick");
        vec![TimeSyncAction::InvokeSimTask {
            now: self.now,
            duration: self.step,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(millis: i64, step_millis: i64) -> NextSimTask {
        NextSimTask {
            time_point: SimTime::from_millis(millis),
            duration: SimStep::from_millis(step_millis),
        }
    }

    fn invoked_at(actions: &[TimeSyncAction]) -> Vec<SimTime> {
        actions
            .iter()
            .filter_map(|a| match a {
                TimeSyncAction::InvokeSimTask { now, .. } => Some(*now),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn first_tick_runs_at_zero_without_waiting() {
        let mut sync = TimeSyncState::new(SimStep::from_millis(1));
        sync.handle(TimeSyncEvent::PeerJoined("B".to_string()));
        let actions = sync.handle(TimeSyncEvent::Start);
        assert_eq!(invoked_at(&actions), vec![SimTime::ZERO]);
    }

    #[test]
    fn barrier_blocks_until_every_peer_reaches_our_point() {
        let mut sync = TimeSyncState::new(SimStep::from_millis(1));
        sync.handle(TimeSyncEvent::PeerJoined("B".to_string()));
        sync.handle(TimeSyncEvent::PeerJoined("C".to_string()));
        sync.handle(TimeSyncEvent::Start);

        let actions = sync.handle(TimeSyncEvent::StepCompleted);
        assert_eq!(
            actions[0],
            TimeSyncAction::SendNextSimTask(task(1, 1)),
            "announce next point after the step"
        );
        assert!(invoked_at(&actions).is_empty());

        // One peer reaching the point is not enough.
        let actions = sync.handle(TimeSyncEvent::PeerTask {
            participant_name: "B".to_string(),
            task: task(1, 1),
        });
        assert!(invoked_at(&actions).is_empty());

        let actions = sync.handle(TimeSyncEvent::PeerTask {
            participant_name: "C".to_string(),
            task: task(1, 1),
        });
        assert_eq!(invoked_at(&actions), vec![SimTime::from_millis(1)]);
        assert_eq!(sync.now(), SimTime::from_millis(1));
    }

    #[test]
    fn clock_advances_to_minimum_announced_point() {
        // Our step is 5 ms; the peer runs 1 ms steps. We may only advance
        // once the peer's announcements catch up to our 5 ms point.
        let mut sync = TimeSyncState::new(SimStep::from_millis(5));
        sync.handle(TimeSyncEvent::PeerJoined("B".to_string()));
        sync.handle(TimeSyncEvent::Start);
        sync.handle(TimeSyncEvent::StepCompleted);

        for millis in 1..5 {
            let actions = sync.handle(TimeSyncEvent::PeerTask {
                participant_name: "B".to_string(),
                task: task(millis, 1),
            });
            assert!(invoked_at(&actions).is_empty(), "blocked at {millis}ms");
        }
        let actions = sync.handle(TimeSyncEvent::PeerTask {
            participant_name: "B".to_string(),
            task: task(5, 1),
        });
        assert_eq!(invoked_at(&actions), vec![SimTime::from_millis(5)]);
    }

    #[test]
    fn equal_steps_tick_in_lockstep() {
        let mut a = TimeSyncState::new(SimStep::from_millis(1));
        let mut b = TimeSyncState::new(SimStep::from_millis(1));
        a.handle(TimeSyncEvent::PeerJoined("B".to_string()));
        b.handle(TimeSyncEvent::PeerJoined("A".to_string()));
        a.handle(TimeSyncEvent::Start);
        b.handle(TimeSyncEvent::Start);

        let mut a_times = vec![SimTime::ZERO];
        let mut b_times = vec![SimTime::ZERO];
        for _ in 0..3 {
            let a_out = a.handle(TimeSyncEvent::StepCompleted);
            let b_out = b.handle(TimeSyncEvent::StepCompleted);
            let a_task = match &a_out[0] {
                TimeSyncAction::SendNextSimTask(t) => *t,
                other => panic!("unexpected {other:?}"),
            };
            let b_task = match &b_out[0] {
                TimeSyncAction::SendNextSimTask(t) => *t,
                other => panic!("unexpected {other:?}"),
            };
            let a_adv = a.handle(TimeSyncEvent::PeerTask {
                participant_name: "B".to_string(),
                task: b_task,
            });
            let b_adv = b.handle(TimeSyncEvent::PeerTask {
                participant_name: "A".to_string(),
                task: a_task,
            });
            a_times.extend(invoked_at(&a_adv));
            b_times.extend(invoked_at(&b_adv));
        }

        let expected: Vec<SimTime> = (0..4).map(SimTime::from_millis).collect();
        assert_eq!(a_times, expected);
        assert_eq!(b_times, expected);
    }

    #[test]
    fn step_configuration_preserves_known_peers() {
        let mut sync = TimeSyncState::new(SimStep::from_millis(1));
        sync.handle(TimeSyncEvent::PeerJoined("B".to_string()));
        sync.set_step(SimStep::from_millis(2));
        sync.handle(TimeSyncEvent::Start);

        let actions = sync.handle(TimeSyncEvent::StepCompleted);
        assert_eq!(actions[0], TimeSyncAction::SendNextSimTask(task(2, 2)));
        // Still barred on B despite the step reconfiguration.
        assert!(invoked_at(&actions).is_empty());
    }

    #[test]
    fn stop_suppresses_further_announcements() {
        let mut sync = TimeSyncState::new(SimStep::from_millis(1));
        sync.handle(TimeSyncEvent::Start);
        sync.handle(TimeSyncEvent::Stop);
        // The pending step finishes after cancellation.
        let actions = sync.handle(TimeSyncEvent::StepCompleted);
        assert!(actions.is_empty());
    }

    #[test]
    fn unsynchronized_participant_alone_free_runs() {
        let mut sync = TimeSyncState::new(SimStep::from_millis(1));
        sync.handle(TimeSyncEvent::Start);
        // No peers: each completed step immediately triggers the next tick.
        let actions = sync.handle(TimeSyncEvent::StepCompleted);
        assert_eq!(invoked_at(&actions), vec![SimTime::from_millis(1)]);
    }

    #[test]
    fn pause_withholds_announcement_until_resume() {
        let mut sync = TimeSyncState::new(SimStep::from_millis(1));
        sync.handle(TimeSyncEvent::PeerJoined("B".to_string()));
        sync.handle(TimeSyncEvent::Start);
        sync.handle(TimeSyncEvent::Pause);

        let actions = sync.handle(TimeSyncEvent::StepCompleted);
        assert!(actions.is_empty(), "no announcement while paused");

        let actions = sync.handle(TimeSyncEvent::Resume);
        assert_eq!(actions[0], TimeSyncAction::SendNextSimTask(task(1, 1)));
    }
}
