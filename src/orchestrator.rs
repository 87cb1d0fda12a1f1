//! From a command to per-task reports.
//!
//! The [`Orchestrator`] asks the planning oracle for a plan, spawns one agent per planned slot,
//! and then runs the interleaving scheduler. Between rounds it hands the next ready task to every
//! idle agent, so a plan may have more tasks than agents. A task is ready once every task it
//! depends on succeeded; if one of them failed, it is reported as `DependencyFailed` instead.
//!
//! [`Orchestrator::execute_with_cancel`] also takes task indices from a channel between rounds
//! and ends those tasks as `Cancelled`, whether they are running or still queued.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::ThorConfig;
use crate::error::TaskError;
use crate::geometry::Pose;
use crate::navigation::Navigator;
use crate::oracle::{parse_plan, Plan, PlanningContext, PlanningOracle};
use crate::report::{unix_now, ReportStore, TaskReport};
use crate::scheduler::{Completed, FrameSink, InterleavingScheduler, StepMachine};
use crate::session::SceneSession;
use crate::simulator::{Action, AgentId};
use crate::task::{TaskMachine, TaskSpec};

/// Orchestrator-side view of one agent. Pose and held object come from simulator metadata only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    pub pose: Pose,
    pub held_object: Option<String>,
    pub task: Option<usize>,
}

impl AgentState {
    fn refresh(&mut self, session: &SceneSession) -> Result<(), TaskError> {
        let meta = session.observe(self.id)?;
        self.pose = meta.agent.pose;
        self.held_object = meta.agent.held_object;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub scene: String,
    pub rounds: u64,
    pub agents: Vec<AgentState>,
    /// One report per planned task, in plan order.
    pub reports: Vec<TaskReport>,
}

impl ExecutionSummary {
    pub fn succeeded(&self) -> usize {
        self.reports.iter().filter(|r| r.success).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded() == self.reports.len()
    }
}

pub struct Orchestrator {
    config: ThorConfig,
    nav: Navigator,
    oracle: Box<dyn PlanningOracle>,
    store: Option<ReportStore>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("scene", &self.config.orchestrator.scene)
            .field("max_agents", &self.config.orchestrator.max_agents)
            .field("report_store", &self.store.is_some())
            .finish()
    }
}

impl Orchestrator {
    /// Opens the report store when one is configured.
    pub fn new(config: ThorConfig, oracle: Box<dyn PlanningOracle>) -> Result<Self, TaskError> {
        config.validate()?;
        let store = config
            .orchestrator
            .report_store
            .as_deref()
            .map(ReportStore::open)
            .transpose()?;
        Ok(Self {
            nav: Navigator::from_config(&config),
            config,
            oracle,
            store,
        })
    }

    pub fn with_store(mut self, store: ReportStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &ThorConfig {
        &self.config
    }

    pub fn store(&self) -> Option<&ReportStore> {
        self.store.as_ref()
    }

    /// Asks the oracle for a plan and validates it. Nothing is spawned here.
    pub async fn plan(&self, command: &str, context: &PlanningContext) -> Result<Plan, TaskError> {
        let limit = Duration::from_secs(self.config.orchestrator.oracle_timeout_secs);
        let answer = match tokio::time::timeout(limit, self.oracle.propose(command, context)).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => return Err(TaskError::PlanningUnavailable(e)),
            Err(_) => {
                return Err(TaskError::PlanningUnavailable(format!(
                    "oracle did not answer within {}s",
                    limit.as_secs()
                )))
            }
        };
        tracing::debug!(chars = answer.len(), "oracle answered");
        parse_plan(&answer, self.config.orchestrator.max_agents)
    }

    /// Plans `command` and executes the plan in `session`.
    pub async fn run_command(
        &self,
        session: &mut SceneSession,
        command: &str,
        sink: &mut dyn FrameSink,
    ) -> Result<ExecutionSummary, TaskError> {
        tracing::info!(command, scene = session.scene(), "command received");
        let context = PlanningContext::from_session(session, self.config.orchestrator.max_agents)?;
        let plan = self.plan(command, &context).await?;
        self.execute(session, &plan, sink)
    }

    /// Reloads the scene with `count` agents and places them at the configured start positions.
    pub fn spawn_agents(&self, session: &mut SceneSession, count: usize) -> Result<Vec<AgentState>, TaskError> {
        session.reset(count)?;
        let mut agents = Vec::with_capacity(count);
        for index in 0..count {
            let id = AgentId(index);
            let pose = Pose::new(self.config.orchestrator.start_position(index), 0.0, 0.0);
            let result = session.execute(id, &Action::Teleport { pose })?;
            if !result.success {
                tracing::warn!(
                    agent = %id,
                    error = result.error_message.as_deref().unwrap_or("unknown"),
                    "teleport to start position failed, keeping simulator start"
                );
            }
            let mut state = AgentState {
                id,
                pose,
                held_object: None,
                task: None,
            };
            state.refresh(session)?;
            agents.push(state);
        }
        tracing::info!(count, "agents spawned");
        Ok(agents)
    }

    /// Stops the simulator backend and ends the session.
    pub fn shutdown(&self, session: SceneSession) {
        session.teardown();
    }

    fn new_report(&self, index: usize, spec: &TaskSpec) -> TaskReport {
        TaskReport {
            task_index: index,
            kind: spec.kind.name().to_string(),
            description: spec.description.clone(),
            agent: None,
            success: false,
            failure: None,
            message: None,
            last_sim_error: None,
            phases: Vec::new(),
            steps: 0,
            finished_round: 0,
            timestamp: 0,
        }
    }

    fn finish(&self, report: &mut TaskReport, outcome: &Result<(), TaskError>, round: u64) {
        report.set_outcome(outcome);
        report.finished_round = round;
        report.timestamp = unix_now();
        match outcome {
            Ok(()) => tracing::info!(task = report.task_index, kind = %report.kind, round, "task succeeded"),
            Err(e) => tracing::warn!(task = report.task_index, kind = %report.kind, round, error = %e, "task failed"),
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.record(report) {
                tracing::warn!(task = report.task_index, error = %e, "failed to persist report");
            }
        }
    }

    /// Runs every task of `plan`, reporting each exactly once.
    pub fn execute(
        &self,
        session: &mut SceneSession,
        plan: &Plan,
        sink: &mut dyn FrameSink,
    ) -> Result<ExecutionSummary, TaskError> {
        self.run_plan(session, plan, sink, None)
    }

    /// Like [`Orchestrator::execute`], but cancels the tasks whose indices arrive on `cancel`.
    ///
    /// Requests are read at round boundaries. A running task is force-failed through the
    /// scheduler; a queued one is reported without ever getting an agent.
    pub fn execute_with_cancel(
        &self,
        session: &mut SceneSession,
        plan: &Plan,
        sink: &mut dyn FrameSink,
        cancel: &mut mpsc::UnboundedReceiver<usize>,
    ) -> Result<ExecutionSummary, TaskError> {
        self.run_plan(session, plan, sink, Some(cancel))
    }

    fn run_plan(
        &self,
        session: &mut SceneSession,
        plan: &Plan,
        sink: &mut dyn FrameSink,
        mut cancel: Option<&mut mpsc::UnboundedReceiver<usize>>,
    ) -> Result<ExecutionSummary, TaskError> {
        let mut agents = self.spawn_agents(session, plan.num_agents)?;
        let mut queue: VecDeque<usize> = (0..plan.tasks.len()).collect();
        let mut reports: Vec<TaskReport> = plan
            .tasks
            .iter()
            .enumerate()
            .map(|(i, spec)| self.new_report(i, spec))
            .collect();
        let mut finished: BTreeMap<usize, bool> = BTreeMap::new();
        let mut scheduler = InterleavingScheduler::new(self.config.scheduler.clone());

        loop {
            if let Some(rx) = cancel.as_mut() {
                while let Ok(index) = rx.try_recv() {
                    if let Some(pos) = queue.iter().position(|queued| *queued == index) {
                        queue.remove(pos);
                        self.finish(&mut reports[index], &Err(TaskError::Cancelled), scheduler.round());
                        finished.insert(index, false);
                        continue;
                    }
                    let running = agents.iter().find(|a| a.task == Some(index)).map(|a| a.id);
                    match running.and_then(|agent| scheduler.cancel(agent)) {
                        Some(completed) => {
                            self.settle(completed, session, &mut agents, &mut reports, &mut finished)
                        }
                        None => tracing::debug!(task = index, "cancel request ignored, task is not pending"),
                    }
                }
            }
            self.fail_blocked(plan, &mut queue, &mut reports, &mut finished, scheduler.round());
            self.assign(&mut scheduler, &mut agents, &mut queue, &finished, plan);

            if scheduler.is_idle() {
                if !queue.is_empty() {
                    tracing::warn!(queued = queue.len(), "no task is ready and no agent is busy");
                }
                break;
            }
            if scheduler.exhausted() {
                break;
            }

            for completed in scheduler.run_round(session, sink) {
                self.settle(completed, session, &mut agents, &mut reports, &mut finished);
            }
        }

        for completed in scheduler.expire() {
            self.settle(completed, session, &mut agents, &mut reports, &mut finished);
        }
        self.fail_blocked(plan, &mut queue, &mut reports, &mut finished, scheduler.round());
        for index in queue.drain(..) {
            self.finish(&mut reports[index], &Err(TaskError::Timeout), scheduler.round());
        }

        for agent in agents.iter_mut() {
            agent.refresh(session)?;
        }

        let summary = ExecutionSummary {
            scene: session.scene().to_string(),
            rounds: scheduler.round(),
            agents,
            reports,
        };
        tracing::info!(
            rounds = summary.rounds,
            succeeded = summary.succeeded(),
            tasks = summary.reports.len(),
            "plan executed"
        );
        Ok(summary)
    }

    /// Reports queued tasks whose dependencies can no longer succeed.
    fn fail_blocked(
        &self,
        plan: &Plan,
        queue: &mut VecDeque<usize>,
        reports: &mut [TaskReport],
        finished: &mut BTreeMap<usize, bool>,
        round: u64,
    ) {
        // failures cascade along chains, so repeat until nothing changes
        loop {
            let blocked = queue.iter().enumerate().find_map(|(pos, index)| {
                self.failed_dependency(&plan.tasks[*index].depends_on, finished)
                    .map(|dep| (pos, *index, dep))
            });
            let Some((pos, index, dep)) = blocked else {
                return;
            };
            queue.remove(pos);
            self.finish(&mut reports[index], &Err(TaskError::DependencyFailed(dep)), round);
            finished.insert(index, false);
        }
    }

    fn failed_dependency(&self, deps: &[usize], finished: &BTreeMap<usize, bool>) -> Option<usize> {
        deps.iter().copied().find(|d| finished.get(d) == Some(&false))
    }

    fn assign(
        &self,
        scheduler: &mut InterleavingScheduler<TaskMachine>,
        agents: &mut [AgentState],
        queue: &mut VecDeque<usize>,
        finished: &BTreeMap<usize, bool>,
        plan: &Plan,
    ) {
        for agent in agents.iter_mut().filter(|a| a.task.is_none()) {
            let ready = queue.iter().position(|index| {
                plan.tasks[*index]
                    .depends_on
                    .iter()
                    .all(|d| finished.get(d) == Some(&true))
            });
            let Some(pos) = ready else {
                return;
            };
            let Some(index) = queue.remove(pos) else {
                return;
            };
            let machine = TaskMachine::new(
                agent.id,
                plan.tasks[index].clone(),
                self.nav.clone(),
                self.config.task.interaction_retries,
            );
            if scheduler.register(agent.id, machine).is_err() {
                queue.push_front(index);
                continue;
            }
            tracing::info!(agent = %agent.id, task = index, kind = plan.tasks[index].kind.name(), round = scheduler.round(), "task assigned");
            agent.task = Some(index);
        }
    }

    fn settle(
        &self,
        completed: Completed<TaskMachine>,
        session: &SceneSession,
        agents: &mut [AgentState],
        reports: &mut [TaskReport],
        finished: &mut BTreeMap<usize, bool>,
    ) {
        let Some(agent) = agents.iter_mut().find(|a| a.id == completed.agent) else {
            return;
        };
        let Some(index) = agent.task.take() else {
            return;
        };
        if let Err(e) = agent.refresh(session) {
            tracing::warn!(agent = %agent.id, error = %e, "could not refresh agent state");
        }

        let machine = completed.machine;
        let outcome = machine.outcome().cloned().unwrap_or(Err(TaskError::Timeout));
        let report = &mut reports[index];
        report.agent = Some(completed.agent);
        report.phases = machine.phase_history().to_vec();
        report.steps = machine.steps();
        report.last_sim_error = session.last_error(completed.agent).map(str::to_string);
        self.finish(report, &outcome, completed.round);
        finished.insert(index, outcome.is_ok());
    }
}
