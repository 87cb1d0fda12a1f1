//! Typed tasks and the resumable per-task step state machine.
//!
//! A [`TaskMachine`] owns everything one agent needs to carry out one [`TaskSpec`]. Each call to
//! [`StepMachine::step`] runs any number of simulator queries but issues at most one
//! state-changing action, so the scheduler can interleave several machines inside one session.

use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::motion::{ScanStatus, VerticalScan};
use crate::navigation::{Approach, ApproachStatus, Navigator};
use crate::scheduler::{Outcome, StepMachine, StepStatus};
use crate::session::SceneSession;
use crate::simulator::{Action, AgentId, ObjectMeta};
use crate::spatial::ObjectRef;

/// Light switch target state. Accepts the Korean verbs used in commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightAction {
    #[serde(alias = "켜기", alias = "turn_on")]
    On,
    #[serde(alias = "끄기", alias = "turn_off")]
    Off,
}

/// The closed set of task kinds the planning oracle may request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "parameters", rename_all = "snake_case")]
pub enum TaskKind {
    SliceAndStore {
        source_object: String,
        target_object: String,
    },
    ToggleLight {
        action: LightAction,
    },
    HeatObject {
        object: String,
    },
    CleanObject {
        object: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Pickup,
    Put,
    Slice,
    Open,
    Close,
    ToggleOn,
    ToggleOff,
    Clean,
}

impl Verb {
    pub fn action(&self, object_id: String) -> Action {
        match self {
            Self::Pickup => Action::PickupObject { object_id },
            Self::Put => Action::PutObject { object_id },
            Self::Slice => Action::SliceObject { object_id },
            Self::Open => Action::OpenObject { object_id },
            Self::Close => Action::CloseObject { object_id },
            Self::ToggleOn => Action::ToggleObjectOn { object_id },
            Self::ToggleOff => Action::ToggleObjectOff { object_id },
            Self::Clean => Action::CleanObject { object_id },
        }
    }

    /// The object is already in the state this verb would produce.
    fn already_satisfied(&self, object: &ObjectMeta) -> bool {
        match self {
            Self::ToggleOn => object.is_toggled,
            Self::ToggleOff => !object.is_toggled,
            Self::Open => object.is_open,
            Self::Close => !object.is_open,
            _ => false,
        }
    }
}

/// Which bound object an interaction applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Primary,
    Secondary,
    /// A slice produced by slicing the primary object.
    SliceOfPrimary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interaction {
    pub verb: Verb,
    pub target: Target,
}

const fn on(verb: Verb, target: Target) -> Interaction {
    Interaction { verb, target }
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SliceAndStore { .. } => "slice_and_store",
            Self::ToggleLight { .. } => "toggle_light",
            Self::HeatObject { .. } => "heat_object",
            Self::CleanObject { .. } => "clean_object",
        }
    }

    pub fn primary(&self) -> ObjectRef {
        match self {
            Self::SliceAndStore { source_object, .. } => ObjectRef::parse(source_object),
            Self::ToggleLight { .. } => ObjectRef::Type("LightSwitch".into()),
            Self::HeatObject { object } | Self::CleanObject { object } => ObjectRef::parse(object),
        }
    }

    pub fn secondary(&self) -> Option<ObjectRef> {
        match self {
            Self::SliceAndStore { target_object, .. } => Some(ObjectRef::parse(target_object)),
            Self::ToggleLight { .. } => None,
            Self::HeatObject { .. } => Some(ObjectRef::Type("Microwave".into())),
            Self::CleanObject { .. } => Some(ObjectRef::Type("SinkBasin".into())),
        }
    }

    pub fn primary_script(&self) -> Vec<Interaction> {
        use Target::*;
        match self {
            Self::SliceAndStore { .. } => vec![on(Verb::Slice, Primary), on(Verb::Pickup, SliceOfPrimary)],
            Self::ToggleLight { action: LightAction::On } => vec![on(Verb::ToggleOn, Primary)],
            Self::ToggleLight { action: LightAction::Off } => vec![on(Verb::ToggleOff, Primary)],
            Self::HeatObject { .. } | Self::CleanObject { .. } => vec![on(Verb::Pickup, Primary)],
        }
    }

    pub fn secondary_script(&self) -> Vec<Interaction> {
        use Target::*;
        match self {
            Self::SliceAndStore { .. } => vec![
                on(Verb::Open, Secondary),
                on(Verb::Put, Secondary),
                on(Verb::Close, Secondary),
            ],
            Self::ToggleLight { .. } => Vec::new(),
            Self::HeatObject { .. } => vec![
                on(Verb::Open, Secondary),
                on(Verb::Put, Secondary),
                on(Verb::Close, Secondary),
                on(Verb::ToggleOn, Secondary),
            ],
            Self::CleanObject { .. } => vec![on(Verb::Clean, Primary)],
        }
    }
}

/// A validated task as produced by the planning oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub kind: TaskKind,
    #[serde(default)]
    pub description: String,
    /// Indices of earlier tasks that must succeed first.
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

impl TaskSpec {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            description: kind.name().to_string(),
            kind,
            depends_on: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn after(mut self, depends_on: Vec<usize>) -> Self {
        self.depends_on = depends_on;
        self
    }
}

/// Task phases in the only order they can be entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Locate,
    ApproachPrimary,
    OrientScan,
    InteractPrimary,
    ApproachSecondary,
    InteractSecondary,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Stop for this step: an action was issued or the machine is terminal.
    Yield,
    /// The phase changed without any action; keep going in the same step.
    Next,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Primary,
    Secondary,
}

/// One agent executing one task.
#[derive(Debug)]
pub struct TaskMachine {
    agent: AgentId,
    spec: TaskSpec,
    nav: Navigator,
    interaction_retries: u32,
    phase: Phase,
    history: Vec<Phase>,
    primary_id: Option<String>,
    primary_type: Option<String>,
    secondary_id: Option<String>,
    approach: Option<Approach>,
    scan: Option<VerticalScan>,
    cursor: usize,
    failed_attempts: u32,
    steps: u64,
    outcome: Option<Outcome>,
}

impl TaskMachine {
    pub fn new(agent: AgentId, spec: TaskSpec, nav: Navigator, interaction_retries: u32) -> Self {
        Self {
            agent,
            spec,
            nav,
            interaction_retries,
            phase: Phase::Locate,
            history: vec![Phase::Locate],
            primary_id: None,
            primary_type: None,
            secondary_id: None,
            approach: None,
            scan: None,
            cursor: 0,
            failed_attempts: 0,
            steps: 0,
            outcome: None,
        }
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase entered so far, in order.
    pub fn phase_history(&self) -> &[Phase] {
        &self.history
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn primary_id(&self) -> Option<&str> {
        self.primary_id.as_deref()
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(agent = %self.agent, task = self.spec.kind.name(), from = ?self.phase, to = ?phase, "phase");
        self.phase = phase;
        self.history.push(phase);
        if phase == Phase::Done {
            tracing::info!(agent = %self.agent, task = self.spec.kind.name(), steps = self.steps, "task done");
            self.outcome = Some(Ok(()));
        }
    }

    fn fail(&mut self, error: TaskError) {
        tracing::warn!(agent = %self.agent, task = self.spec.kind.name(), phase = ?self.phase, %error, "task failed");
        self.approach = None;
        self.scan = None;
        self.phase = Phase::Failed;
        self.history.push(Phase::Failed);
        self.outcome = Some(Err(error));
    }

    fn advance(&mut self, session: &mut SceneSession) -> Result<(), TaskError> {
        loop {
            let flow = match self.phase {
                Phase::Locate => self.locate(session)?,
                Phase::ApproachPrimary => self.approach(session, Side::Primary)?,
                Phase::OrientScan => self.orient_scan(session)?,
                Phase::InteractPrimary => self.interact(session, Side::Primary)?,
                Phase::ApproachSecondary => self.approach(session, Side::Secondary)?,
                Phase::InteractSecondary => self.interact(session, Side::Secondary)?,
                Phase::Done | Phase::Failed => Flow::Yield,
            };
            if flow == Flow::Yield {
                return Ok(());
            }
        }
    }

    fn locate(&mut self, session: &mut SceneSession) -> Result<Flow, TaskError> {
        let object = self
            .nav
            .spatial
            .resolve(session, self.agent, &self.spec.kind.primary())?;
        self.nav.spatial.reachable_positions(session, self.agent)?;
        tracing::debug!(agent = %self.agent, object_id = %object.object_id, "primary target bound");
        self.approach = Some(Approach::new(object.object_id.clone()));
        self.primary_id = Some(object.object_id);
        self.primary_type = Some(object.object_type);
        self.enter(Phase::ApproachPrimary);
        Ok(Flow::Next)
    }

    fn bound_id(&self, side: Side) -> Result<String, TaskError> {
        let id = match side {
            Side::Primary => self.primary_id.clone(),
            Side::Secondary => self.secondary_id.clone(),
        };
        id.ok_or_else(|| TaskError::TargetNotFound(format!("{side:?} target is not bound")))
    }

    fn approach(&mut self, session: &mut SceneSession, side: Side) -> Result<Flow, TaskError> {
        if side == Side::Secondary && self.secondary_id.is_none() {
            let reference = self.spec.kind.secondary().ok_or_else(|| {
                TaskError::TargetNotFound(format!("{} has no secondary target", self.spec.kind.name()))
            })?;
            let object = self.nav.spatial.resolve(session, self.agent, &reference)?;
            tracing::debug!(agent = %self.agent, object_id = %object.object_id, "secondary target bound");
            self.approach = Some(Approach::new(object.object_id.clone()).with_scan());
            self.secondary_id = Some(object.object_id);
        }

        let id = self.bound_id(side)?;
        self.nav.spatial.resolve(session, self.agent, &ObjectRef::Id(id.clone()))?;

        let approach = self.approach.get_or_insert_with(|| match side {
            Side::Primary => Approach::new(id),
            Side::Secondary => Approach::new(id).with_scan(),
        });
        match approach.step(&self.nav, session, self.agent)? {
            ApproachStatus::InProgress => Ok(Flow::Yield),
            ApproachStatus::Arrived => {
                self.approach = None;
                self.enter(match side {
                    Side::Primary => Phase::OrientScan,
                    Side::Secondary => Phase::InteractSecondary,
                });
                Ok(Flow::Next)
            }
        }
    }

    fn orient_scan(&mut self, session: &mut SceneSession) -> Result<Flow, TaskError> {
        let id = self.bound_id(Side::Primary)?;
        let scan = self
            .scan
            .get_or_insert_with(|| VerticalScan::new(self.nav.scan.clone()));
        match scan.step(session, self.agent, &id)? {
            ScanStatus::Scanning => Ok(Flow::Yield),
            ScanStatus::Found => {
                self.scan = None;
                self.enter(Phase::InteractPrimary);
                Ok(Flow::Next)
            }
            ScanStatus::NotVisible => Err(TaskError::TargetNotVisible(id)),
        }
    }

    fn resolve_target(&self, session: &SceneSession, target: Target) -> Result<ObjectMeta, TaskError> {
        match target {
            Target::Primary => {
                let id = self.bound_id(Side::Primary)?;
                self.nav.spatial.resolve(session, self.agent, &ObjectRef::Id(id))
            }
            Target::Secondary => {
                let id = self.bound_id(Side::Secondary)?;
                self.nav.spatial.resolve(session, self.agent, &ObjectRef::Id(id))
            }
            Target::SliceOfPrimary => {
                let base = self.primary_type.as_deref().unwrap_or_default();
                self.nav
                    .spatial
                    .nearest_of_type(session, self.agent, &format!("{base}Sliced"))
            }
        }
    }

    /// Leaves an interaction phase whose script is complete and returns the phase entered.
    fn finish_script(&mut self, side: Side) -> Phase {
        self.cursor = 0;
        self.failed_attempts = 0;
        let next = match side {
            Side::Primary if self.spec.kind.secondary().is_some() => Phase::ApproachSecondary,
            _ => Phase::Done,
        };
        self.enter(next);
        next
    }

    fn interact(&mut self, session: &mut SceneSession, side: Side) -> Result<Flow, TaskError> {
        let script = match side {
            Side::Primary => self.spec.kind.primary_script(),
            Side::Secondary => self.spec.kind.secondary_script(),
        };

        let Some(step) = script.get(self.cursor).copied() else {
            let next = self.finish_script(side);
            return Ok(if next == Phase::Done { Flow::Yield } else { Flow::Next });
        };

        let object = self.resolve_target(session, step.target)?;
        if step.verb.already_satisfied(&object) {
            tracing::info!(agent = %self.agent, verb = ?step.verb, object_id = %object.object_id, "already in requested state, skipping");
            self.cursor += 1;
            self.failed_attempts = 0;
            return Ok(Flow::Next);
        }

        let action = step.verb.action(object.object_id);
        let result = session.execute(self.agent, &action)?;
        if result.success {
            self.cursor += 1;
            self.failed_attempts = 0;
            if self.cursor == script.len() {
                // the action is already spent, so the next phase starts on the next step
                self.finish_script(side);
            }
            return Ok(Flow::Yield);
        }

        self.failed_attempts += 1;
        let message = result
            .error_message
            .unwrap_or_else(|| format!("{} failed", action.name()));
        if self.failed_attempts > self.interaction_retries {
            return Err(TaskError::InteractionFailed {
                action: action.name().to_string(),
                message,
            });
        }
        tracing::info!(agent = %self.agent, action = action.name(), %message, attempt = self.failed_attempts, "interaction failed, retrying");
        Ok(Flow::Yield)
    }
}

impl StepMachine for TaskMachine {
    fn step(&mut self, session: &mut SceneSession) -> StepStatus {
        if self.is_terminal() {
            return self.status();
        }
        self.steps += 1;
        if let Err(error) = self.advance(session) {
            self.fail(error);
        }
        self.status()
    }

    fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    fn force_fail(&mut self, error: TaskError) {
        if !self.is_terminal() {
            self.fail(error);
        }
    }

    fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }
}

impl TaskMachine {
    fn status(&self) -> StepStatus {
        match &self.outcome {
            None => StepStatus::Running,
            Some(Ok(())) => StepStatus::Done,
            Some(Err(_)) => StepStatus::Failed,
        }
    }
}
