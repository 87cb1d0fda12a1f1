//! Round-robin interleaving of step machines over one simulator session.
//!
//! Each round, every registered machine steps exactly once, in registration order, and the
//! frame hook runs once per agent right after its step. Terminal machines leave the schedule
//! at the end of the round. Nothing here knows about tasks; any [`StepMachine`] can be driven.

use std::time::{Duration, Instant};

use crate::config::SchedulerConfig;
use crate::error::TaskError;
use crate::session::SceneSession;
use crate::simulator::AgentId;

/// Final result of a machine.
pub type Outcome = Result<(), TaskError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Running,
    Done,
    Failed,
}

/// A resumable unit of work that advances by one bounded step at a time.
///
/// A step may issue any number of simulator queries but at most one state-changing action.
pub trait StepMachine {
    fn step(&mut self, session: &mut SceneSession) -> StepStatus;

    fn is_terminal(&self) -> bool;

    /// Terminates the machine with `error` unless it already finished.
    fn force_fail(&mut self, error: TaskError);

    fn outcome(&self) -> Option<&Outcome>;
}

/// Per-agent hook invoked after every step, e.g. to grab a video frame.
pub trait FrameSink {
    fn capture(&mut self, round: u64, agent: AgentId, session: &SceneSession);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFrameSink;

impl FrameSink for NoopFrameSink {
    fn capture(&mut self, _round: u64, _agent: AgentId, _session: &SceneSession) {}
}

/// A machine that left the schedule.
#[derive(Debug)]
pub struct Completed<M> {
    pub agent: AgentId,
    /// Round in which the machine terminated.
    pub round: u64,
    pub machine: M,
}

/// Result of [`InterleavingScheduler::run`].
#[derive(Debug)]
pub struct RunSummary<M> {
    pub rounds: u64,
    pub completed: Vec<Completed<M>>,
    /// Whether the budget ran out with machines still active.
    pub timed_out: bool,
}

pub struct InterleavingScheduler<M> {
    config: SchedulerConfig,
    active: Vec<(AgentId, M)>,
    round: u64,
    deadline: Option<Instant>,
}

impl<M: StepMachine> InterleavingScheduler<M> {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            active: Vec::new(),
            round: 0,
            deadline: None,
        }
    }

    /// Adds `machine` for `agent` after every machine registered so far.
    ///
    /// An agent runs at most one machine at a time; a second registration hands the machine
    /// back.
    pub fn register(&mut self, agent: AgentId, machine: M) -> Result<(), M> {
        if self.is_active(agent) {
            tracing::warn!(%agent, "agent already has an active machine");
            return Err(machine);
        }
        tracing::debug!(%agent, round = self.round, "machine registered");
        self.active.push((agent, machine));
        Ok(())
    }

    /// Removes the agent's machine, terminating it with `Cancelled`.
    pub fn cancel(&mut self, agent: AgentId) -> Option<Completed<M>> {
        let index = self.active.iter().position(|(a, _)| *a == agent)?;
        let (agent, mut machine) = self.active.remove(index);
        machine.force_fail(TaskError::Cancelled);
        tracing::info!(%agent, round = self.round, "machine cancelled");
        Some(Completed {
            agent,
            round: self.round,
            machine,
        })
    }

    pub fn is_active(&self, agent: AgentId) -> bool {
        self.active.iter().any(|(a, _)| *a == agent)
    }

    pub fn active_agents(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.active.iter().map(|(a, _)| *a)
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Rounds run so far.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Whether the round or wall-clock budget is spent.
    pub fn exhausted(&self) -> bool {
        self.round >= self.config.max_rounds
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn arm_deadline(&mut self) {
        if self.deadline.is_none() {
            self.deadline = self
                .config
                .max_duration_secs
                .map(|secs| Instant::now() + Duration::from_secs(secs));
        }
    }

    /// Steps every active machine once and returns those that terminated.
    pub fn run_round(&mut self, session: &mut SceneSession, sink: &mut dyn FrameSink) -> Vec<Completed<M>> {
        self.arm_deadline();
        self.round += 1;
        let round = self.round;
        session.begin_round(round);

        for (agent, machine) in self.active.iter_mut() {
            if !machine.is_terminal() {
                let status = machine.step(session);
                tracing::trace!(%agent, round, ?status, "step");
            }
            sink.capture(round, *agent, session);
        }

        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|(_, m)| m.is_terminal());
        self.active = running;

        finished
            .into_iter()
            .map(|(agent, machine)| {
                tracing::debug!(%agent, round, ok = matches!(machine.outcome(), Some(Ok(()))), "machine finished");
                Completed {
                    agent,
                    round,
                    machine,
                }
            })
            .collect()
    }

    /// Force-fails every active machine with `Timeout`.
    pub fn expire(&mut self) -> Vec<Completed<M>> {
        let round = self.round;
        std::mem::take(&mut self.active)
            .into_iter()
            .map(|(agent, mut machine)| {
                machine.force_fail(TaskError::Timeout);
                tracing::warn!(%agent, round, "machine timed out");
                Completed {
                    agent,
                    round,
                    machine,
                }
            })
            .collect()
    }

    /// Runs rounds until every machine terminated or the budget is spent.
    pub fn run(&mut self, session: &mut SceneSession, sink: &mut dyn FrameSink) -> RunSummary<M> {
        self.arm_deadline();
        let mut completed = Vec::new();
        while !self.active.is_empty() && !self.exhausted() {
            completed.extend(self.run_round(session, sink));
        }
        let timed_out = !self.active.is_empty();
        completed.extend(self.expire());
        RunSummary {
            rounds: self.round,
            completed,
            timed_out,
        }
    }
}

impl<M> std::fmt::Debug for InterleavingScheduler<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterleavingScheduler")
            .field("round", &self.round)
            .field("active", &self.active.iter().map(|(a, _)| *a).collect::<Vec<_>>())
            .field("max_rounds", &self.config.max_rounds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLayout, MockSimulator};
    use crate::simulator::Action;

    /// Rotates once per step for a fixed number of steps.
    struct Scripted {
        agent: AgentId,
        remaining: u32,
        outcome: Option<Outcome>,
    }

    impl Scripted {
        fn new(agent: usize, steps: u32) -> Self {
            Self {
                agent: AgentId(agent),
                remaining: steps,
                outcome: None,
            }
        }
    }

    impl StepMachine for Scripted {
        fn step(&mut self, session: &mut SceneSession) -> StepStatus {
            session
                .execute(self.agent, &Action::RotateRight { degrees: 10.0 })
                .unwrap();
            self.remaining -= 1;
            if self.remaining == 0 {
                self.outcome = Some(Ok(()));
                return StepStatus::Done;
            }
            StepStatus::Running
        }

        fn is_terminal(&self) -> bool {
            self.outcome.is_some()
        }

        fn force_fail(&mut self, error: TaskError) {
            if self.outcome.is_none() {
                self.outcome = Some(Err(error));
            }
        }

        fn outcome(&self) -> Option<&Outcome> {
            self.outcome.as_ref()
        }
    }

    #[derive(Default)]
    struct CountingSink(Vec<(u64, AgentId)>);

    impl FrameSink for CountingSink {
        fn capture(&mut self, round: u64, agent: AgentId, _session: &SceneSession) {
            self.0.push((round, agent));
        }
    }

    fn session(agents: usize) -> SceneSession {
        SceneSession::create(
            Box::new(MockSimulator::new(MockLayout::room(-3.0, -3.0, 3.0, 3.0))),
            "FloorPlan1",
            agents,
        )
        .unwrap()
    }

    fn scheduler(max_rounds: u64) -> InterleavingScheduler<Scripted> {
        InterleavingScheduler::new(SchedulerConfig {
            max_rounds,
            max_duration_secs: None,
        })
    }

    #[test]
    fn two_five_step_machines_take_five_rounds() {
        let mut s = session(2);
        let mut sched = scheduler(100);
        sched.register(AgentId(0), Scripted::new(0, 5)).ok().unwrap();
        sched.register(AgentId(1), Scripted::new(1, 5)).ok().unwrap();

        let summary = sched.run(&mut s, &mut NoopFrameSink);
        assert_eq!(summary.rounds, 5);
        assert!(!summary.timed_out);
        assert_eq!(summary.completed.len(), 2);
        assert!(summary.completed.iter().all(|c| c.round == 5));
    }

    #[test]
    fn every_round_steps_agents_in_registration_order() {
        let mut s = session(3);
        let mut sched = scheduler(100);
        for (agent, steps) in [(2, 3), (0, 2), (1, 4)] {
            sched.register(AgentId(agent), Scripted::new(agent, steps)).ok().unwrap();
        }
        sched.run(&mut s, &mut NoopFrameSink);

        for round in 1..=2 {
            let order: Vec<usize> = s
                .action_log()
                .iter()
                .filter(|r| r.round == round)
                .map(|r| r.agent.0)
                .collect();
            assert_eq!(order, [2, 0, 1]);
        }
        for round in 1..=4 {
            for agent in 0..3 {
                assert!(s.mutating_actions_in(round, AgentId(agent)) <= 1);
            }
        }
    }

    #[test]
    fn frame_hook_runs_once_per_agent_per_round() {
        let mut s = session(2);
        let mut sched = scheduler(100);
        sched.register(AgentId(0), Scripted::new(0, 2)).ok().unwrap();
        sched.register(AgentId(1), Scripted::new(1, 3)).ok().unwrap();
        let mut sink = CountingSink::default();
        sched.run(&mut s, &mut sink);
        assert_eq!(
            sink.0,
            [
                (1, AgentId(0)),
                (1, AgentId(1)),
                (2, AgentId(0)),
                (2, AgentId(1)),
                (3, AgentId(1))
            ]
        );
    }

    #[test]
    fn round_budget_times_out_survivors() {
        let mut s = session(2);
        let mut sched = scheduler(3);
        sched.register(AgentId(0), Scripted::new(0, 2)).ok().unwrap();
        sched.register(AgentId(1), Scripted::new(1, 50)).ok().unwrap();

        let summary = sched.run(&mut s, &mut NoopFrameSink);
        assert_eq!(summary.rounds, 3);
        assert!(summary.timed_out);
        let slow = summary.completed.iter().find(|c| c.agent == AgentId(1)).unwrap();
        assert_eq!(slow.machine.outcome(), Some(&Err(TaskError::Timeout)));
        let fast = summary.completed.iter().find(|c| c.agent == AgentId(0)).unwrap();
        assert_eq!(fast.machine.outcome(), Some(&Ok(())));
    }

    #[test]
    fn zero_duration_budget_runs_no_round() {
        let mut s = session(1);
        let mut sched = InterleavingScheduler::new(SchedulerConfig {
            max_rounds: 100,
            max_duration_secs: Some(0),
        });
        sched.register(AgentId(0), Scripted::new(0, 2)).ok().unwrap();
        let summary = sched.run(&mut s, &mut NoopFrameSink);
        assert_eq!(summary.rounds, 0);
        assert!(summary.timed_out);
        assert!(s.action_log().is_empty());
    }

    #[test]
    fn cancel_records_cancelled_and_others_continue() {
        let mut s = session(2);
        let mut sched = scheduler(100);
        sched.register(AgentId(0), Scripted::new(0, 4)).ok().unwrap();
        sched.register(AgentId(1), Scripted::new(1, 4)).ok().unwrap();
        sched.run_round(&mut s, &mut NoopFrameSink);

        let cancelled = sched.cancel(AgentId(1)).unwrap();
        assert_eq!(cancelled.machine.outcome(), Some(&Err(TaskError::Cancelled)));
        assert!(sched.cancel(AgentId(1)).is_none());
        assert_eq!(sched.active_agents().collect::<Vec<_>>(), [AgentId(0)]);

        let summary = sched.run(&mut s, &mut NoopFrameSink);
        assert_eq!(summary.rounds, 4);
        assert_eq!(summary.completed.len(), 1);
        assert_eq!(s.action_log().iter().filter(|r| r.agent == AgentId(1)).count(), 1);
    }

    #[test]
    fn second_registration_for_busy_agent_is_rejected() {
        let mut sched = scheduler(10);
        sched.register(AgentId(0), Scripted::new(0, 1)).ok().unwrap();
        assert!(sched.register(AgentId(0), Scripted::new(0, 1)).is_err());
    }
}
