//! A deterministic grid-world simulator.
//!
//! [`MockSimulator`] implements the [`Simulator`] contract over a rectangular room with
//! axis-aligned obstacles, a 0.25 m reachability grid and a small set of interactable
//! objects. Visibility uses a distance limit plus horizontal and vertical field-of-view checks,
//! so the vertical scan behaves as it does in the real simulator. It makes it possible to test
//! the whole navigation and interleaving pipeline without a running AI2-THOR instance.

use std::collections::{HashMap, VecDeque};

use crate::error::SimError;
use crate::geometry::{normalize_angle, Pose, Position};
use crate::simulator::{
    Action, ActionResult, ActionReturn, AgentId, AgentMeta, ObjectMeta, SceneMetadata, Simulator,
};

const EYE_OFFSET: f32 = 0.6;
const HALF_HFOV: f32 = 45.0;
const HALF_VFOV: f32 = 30.0;
const MIN_HORIZON: f32 = -30.0;
const MAX_HORIZON: f32 = 60.0;
const AGENT_RADIUS: f32 = 0.2;

/// An axis-aligned blocked region of the floor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min_x: f32,
    pub min_z: f32,
    pub max_x: f32,
    pub max_z: f32,
}

impl Rect {
    pub fn new(min_x: f32, min_z: f32, max_x: f32, max_z: f32) -> Self {
        Self {
            min_x,
            min_z,
            max_x,
            max_z,
        }
    }

    fn contains(&self, p: &Position) -> bool {
        p.x() >= self.min_x && p.x() <= self.max_x && p.z() >= self.min_z && p.z() <= self.max_z
    }
}

/// Room geometry.
#[derive(Debug, Clone)]
pub struct MockLayout {
    pub bounds: Rect,
    pub grid: f32,
    pub agent_y: f32,
    pub obstacles: Vec<Rect>,
}

impl MockLayout {
    /// An empty rectangular room.
    pub fn room(min_x: f32, min_z: f32, max_x: f32, max_z: f32) -> Self {
        Self {
            bounds: Rect::new(min_x, min_z, max_x, max_z),
            grid: 0.25,
            agent_y: 0.9,
            obstacles: Vec::new(),
        }
    }

    fn walkable(&self, p: &Position) -> bool {
        let eps = 1e-4;
        p.x() >= self.bounds.min_x - eps
            && p.x() <= self.bounds.max_x + eps
            && p.z() >= self.bounds.min_z - eps
            && p.z() <= self.bounds.max_z + eps
            && !self.obstacles.iter().any(|o| o.contains(p))
    }

    fn dims(&self) -> (usize, usize) {
        let nx = ((self.bounds.max_x - self.bounds.min_x) / self.grid + 1e-3).floor() as usize + 1;
        let nz = ((self.bounds.max_z - self.bounds.min_z) / self.grid + 1e-3).floor() as usize + 1;
        (nx, nz)
    }

    fn cell_position(&self, ix: usize, iz: usize) -> Position {
        Position::new(
            self.bounds.min_x + ix as f32 * self.grid,
            self.agent_y,
            self.bounds.min_z + iz as f32 * self.grid,
        )
    }

    fn nearest_cell(&self, p: &Position) -> Option<(usize, usize)> {
        let (nx, nz) = self.dims();
        let ix = ((p.x() - self.bounds.min_x) / self.grid).round();
        let iz = ((p.z() - self.bounds.min_z) / self.grid).round();
        if ix < 0.0 || iz < 0.0 {
            return None;
        }
        let (ix, iz) = (ix as usize, iz as usize);
        (ix < nx && iz < nz).then_some((ix, iz))
    }

    fn cell_walkable(&self, ix: usize, iz: usize) -> bool {
        self.walkable(&self.cell_position(ix, iz))
    }
}

/// One interactable object and its mutable state.
#[derive(Debug, Clone)]
pub struct MockObject {
    pub object_id: String,
    pub object_type: String,
    pub position: Position,
    pub pickupable: bool,
    pub openable: bool,
    pub toggleable: bool,
    pub sliceable: bool,
    pub receptacle: bool,
    pub is_open: bool,
    pub is_toggled: bool,
    pub is_sliced: bool,
    pub is_dirty: bool,
    held_by: Option<usize>,
    parent: Option<String>,
    removed: bool,
}

impl MockObject {
    pub fn new(object_id: &str, object_type: &str, position: Position) -> Self {
        Self {
            object_id: object_id.to_string(),
            object_type: object_type.to_string(),
            position,
            pickupable: false,
            openable: false,
            toggleable: false,
            sliceable: false,
            receptacle: false,
            is_open: false,
            is_toggled: false,
            is_sliced: false,
            is_dirty: false,
            held_by: None,
            parent: None,
            removed: false,
        }
    }

    pub fn pickupable(mut self) -> Self {
        self.pickupable = true;
        self
    }

    pub fn openable(mut self) -> Self {
        self.openable = true;
        self.receptacle = true;
        self
    }

    pub fn receptacle(mut self) -> Self {
        self.receptacle = true;
        self
    }

    pub fn toggleable(mut self, on: bool) -> Self {
        self.toggleable = true;
        self.is_toggled = on;
        self
    }

    pub fn sliceable(mut self) -> Self {
        self.sliceable = true;
        self
    }

    pub fn dirty(mut self) -> Self {
        self.is_dirty = true;
        self
    }
}

#[derive(Debug, Clone)]
struct MockAgent {
    pose: Pose,
    held: Option<String>,
}

/// Deterministic in-process simulator.
#[derive(Debug, Clone)]
pub struct MockSimulator {
    layout: MockLayout,
    initial_objects: Vec<MockObject>,
    objects: Vec<MockObject>,
    starts: Vec<Pose>,
    agents: Vec<MockAgent>,
    shortest_path: bool,
    visibility_distance: f32,
    interaction_distance: f32,
    /// Interactable poses are offered only this close to their object.
    pose_radius: f32,
    forced_failures: HashMap<(usize, String), u32>,
    loaded: bool,
    stopped: bool,
}

impl MockSimulator {
    pub fn new(layout: MockLayout) -> Self {
        Self {
            layout,
            initial_objects: Vec::new(),
            objects: Vec::new(),
            starts: Vec::new(),
            agents: Vec::new(),
            shortest_path: true,
            visibility_distance: 1.5,
            interaction_distance: 1.5,
            pose_radius: 1.0,
            forced_failures: HashMap::new(),
            loaded: false,
            stopped: false,
        }
    }

    /// A 6 m × 6 m kitchen with the objects every built-in task kind needs.
    pub fn kitchen() -> Self {
        Self::new(MockLayout::room(-3.0, -3.0, 3.0, 3.0))
            .with_object(
                MockObject::new("Tomato|1", "Tomato", Position::new(-2.0, 0.95, 2.5))
                    .pickupable()
                    .sliceable(),
            )
            .with_object(MockObject::new("Fridge|1", "Fridge", Position::new(-2.5, 0.9, -2.0)).openable())
            .with_object(
                MockObject::new("LightSwitch|1", "LightSwitch", Position::new(2.5, 1.3, 2.5))
                    .toggleable(true),
            )
            .with_object(MockObject::new("Bread|1", "Bread", Position::new(2.5, 0.95, -0.5)).pickupable())
            .with_object(
                MockObject::new("Microwave|1", "Microwave", Position::new(2.5, 1.0, -2.5))
                    .openable()
                    .toggleable(false),
            )
            .with_object(
                MockObject::new("Plate|1", "Plate", Position::new(0.5, 0.9, 2.7))
                    .pickupable()
                    .dirty(),
            )
            .with_object(MockObject::new("SinkBasin|1", "SinkBasin", Position::new(0.5, 0.85, -2.7)).receptacle())
    }

    pub fn with_obstacle(mut self, rect: Rect) -> Self {
        self.layout.obstacles.push(rect);
        self
    }

    pub fn with_object(mut self, object: MockObject) -> Self {
        self.initial_objects.push(object);
        self
    }

    /// Start pose for the next agent index (cycled when there are more agents).
    pub fn with_agent_start(mut self, pose: Pose) -> Self {
        self.starts.push(pose);
        self
    }

    /// Makes every shortest-path query fail, forcing the direct-line fallback.
    pub fn without_shortest_path(mut self) -> Self {
        self.shortest_path = false;
        self
    }

    /// Makes the next `count` calls of `action` by `agent` fail without effect.
    pub fn fail_next(mut self, agent: AgentId, action: &str, count: u32) -> Self {
        self.forced_failures.insert((agent.0, action.to_string()), count);
        self
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn start_pose(&self, index: usize) -> Pose {
        if self.starts.is_empty() {
            Pose::new(Position::new(index as f32, self.layout.agent_y, 0.0), 0.0, 0.0)
        } else {
            self.starts[index % self.starts.len()]
        }
    }

    fn agent(&self, agent: AgentId) -> Result<&MockAgent, SimError> {
        if !self.loaded {
            return Err(SimError::Backend("no scene loaded".into()));
        }
        self.agents.get(agent.0).ok_or(SimError::UnknownAgent(agent.0))
    }

    fn object_index(&self, object_id: &str) -> Option<usize> {
        self.objects
            .iter()
            .position(|o| o.object_id == object_id && !o.removed)
    }

    fn sees(&self, pose: &Pose, target: &Position) -> bool {
        let dist = pose.position.planar_distance(target);
        if dist > self.visibility_distance {
            return false;
        }
        if dist > 1e-3 && pose.heading_error_to(target).abs() > HALF_HFOV {
            return false;
        }
        let eye = pose.position.y() + EYE_OFFSET;
        let down = (eye - target.y()).atan2(dist).to_degrees();
        (down - pose.horizon).abs() <= HALF_VFOV
    }

    fn is_visible(&self, agent: usize, object: &MockObject) -> bool {
        match object.held_by {
            Some(holder) => holder == agent,
            None => self.sees(&self.agents[agent].pose, &object.position),
        }
    }

    fn build_metadata(&self, agent: usize) -> SceneMetadata {
        let a = &self.agents[agent];
        SceneMetadata {
            agent: AgentMeta {
                pose: a.pose,
                held_object: a.held.clone(),
            },
            objects: self
                .objects
                .iter()
                .filter(|o| !o.removed)
                .map(|o| ObjectMeta {
                    object_id: o.object_id.clone(),
                    object_type: o.object_type.clone(),
                    position: o.position,
                    visible: self.is_visible(agent, o),
                    is_picked_up: o.held_by.is_some(),
                    is_toggled: o.is_toggled,
                    is_open: o.is_open,
                    is_sliced: o.is_sliced,
                    is_dirty: o.is_dirty,
                    parent_receptacle: o.parent.clone(),
                })
                .collect(),
        }
    }

    fn blocked_by_agent(&self, agent: usize, p: &Position) -> bool {
        self.agents
            .iter()
            .enumerate()
            .any(|(i, a)| i != agent && a.pose.position.planar_distance(p) < 2.0 * AGENT_RADIUS)
    }

    fn try_move(&mut self, agent: usize, yaw: f32, magnitude: f32) -> Result<(), String> {
        let from = self.agents[agent].pose.position;
        let to = from.advanced(yaw, magnitude);
        let mid = from.lerp(&to, 0.5);
        if !self.layout.walkable(&to) || !self.layout.walkable(&mid) {
            return Err("Collided with an obstacle".into());
        }
        if self.blocked_by_agent(agent, &to) {
            return Err("Blocked by another agent".into());
        }
        self.agents[agent].pose.position = to;
        Ok(())
    }

    fn reachable(&self) -> Vec<Position> {
        let (nx, nz) = self.layout.dims();
        let mut out = Vec::new();
        for iz in 0..nz {
            for ix in 0..nx {
                if self.layout.cell_walkable(ix, iz) {
                    out.push(self.layout.cell_position(ix, iz));
                }
            }
        }
        out
    }

    fn interactable_poses(&self, object: &MockObject) -> Vec<Pose> {
        let target = object.position;
        self.reachable()
            .into_iter()
            .filter(|p| p.planar_distance(&target) <= self.pose_radius)
            .filter_map(|p| {
                let yaw = p.heading_to(&target);
                [0.0, 30.0, 60.0, -30.0]
                    .into_iter()
                    .map(|h| Pose::new(p, yaw, h))
                    .find(|pose| self.sees(pose, &target))
            })
            .collect()
    }

    fn shortest_path(&self, from: &Position, target: &Position) -> Option<Vec<Position>> {
        let start = self.layout.nearest_cell(from)?;
        let goal = self.layout.nearest_cell(target)?;
        if !self.layout.cell_walkable(goal.0, goal.1) || !self.layout.cell_walkable(start.0, start.1)
        {
            return None;
        }

        let (nx, nz) = self.layout.dims();
        let mut prev: HashMap<(usize, usize), (usize, usize)> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        prev.insert(start, start);

        while let Some(cell) = queue.pop_front() {
            if cell == goal {
                break;
            }
            let (x, z) = (cell.0 as i64, cell.1 as i64);
            for (dx, dz) in [(1, 0), (-1, 0), (0, 1), (0, -1), (1, 1), (1, -1), (-1, 1), (-1, -1)] {
                let (ux, uz) = (x + dx, z + dz);
                if ux < 0 || uz < 0 || ux >= nx as i64 || uz >= nz as i64 {
                    continue;
                }
                let next = (ux as usize, uz as usize);
                if prev.contains_key(&next) || !self.layout.cell_walkable(next.0, next.1) {
                    continue;
                }
                // diagonal moves may not cut obstacle corners
                if dx != 0
                    && dz != 0
                    && (!self.layout.cell_walkable(ux as usize, cell.1)
                        || !self.layout.cell_walkable(cell.0, uz as usize))
                {
                    continue;
                }
                prev.insert(next, cell);
                queue.push_back(next);
            }
        }

        if !prev.contains_key(&goal) {
            return None;
        }

        let mut cells = vec![goal];
        let mut cur = goal;
        while cur != start {
            cur = prev[&cur];
            cells.push(cur);
        }
        cells.reverse();

        // keep only the cells where the direction changes
        let mut corners = vec![*from];
        for w in 1..cells.len() {
            let is_last = w + 1 == cells.len();
            if is_last {
                corners.push(self.layout.cell_position(cells[w].0, cells[w].1));
                continue;
            }
            let d_in = (
                cells[w].0 as i64 - cells[w - 1].0 as i64,
                cells[w].1 as i64 - cells[w - 1].1 as i64,
            );
            let d_out = (
                cells[w + 1].0 as i64 - cells[w].0 as i64,
                cells[w + 1].1 as i64 - cells[w].1 as i64,
            );
            if d_in != d_out {
                corners.push(self.layout.cell_position(cells[w].0, cells[w].1));
            }
        }
        Some(corners)
    }

    fn reachable_for_interaction(&self, agent: usize, idx: usize) -> Result<(), String> {
        let object = &self.objects[idx];
        if object.held_by == Some(agent) {
            return Ok(());
        }
        if !self.is_visible(agent, object) {
            return Err(format!("{} is not visible", object.object_id));
        }
        let dist = self.agents[agent].pose.position.planar_distance(&object.position);
        if dist > self.interaction_distance {
            return Err(format!("{} is out of reach", object.object_id));
        }
        Ok(())
    }

    fn interact(&mut self, agent: usize, action: &Action) -> Result<(), String> {
        let object_id = match action {
            Action::PickupObject { object_id }
            | Action::PutObject { object_id }
            | Action::SliceObject { object_id }
            | Action::OpenObject { object_id }
            | Action::CloseObject { object_id }
            | Action::ToggleObjectOn { object_id }
            | Action::ToggleObjectOff { object_id }
            | Action::CleanObject { object_id } => object_id.clone(),
            _ => return Err(format!("{} is not an interaction", action.name())),
        };
        let idx = self
            .object_index(&object_id)
            .ok_or_else(|| format!("object {object_id} does not exist"))?;
        self.reachable_for_interaction(agent, idx)?;

        match action {
            Action::PickupObject { .. } => {
                if self.agents[agent].held.is_some() {
                    return Err("agent hand is not empty".into());
                }
                let obj = &mut self.objects[idx];
                if !obj.pickupable || obj.held_by.is_some() {
                    return Err(format!("{object_id} cannot be picked up"));
                }
                obj.held_by = Some(agent);
                obj.parent = None;
                self.agents[agent].held = Some(object_id);
            }
            Action::PutObject { .. } => {
                let held = self.agents[agent]
                    .held
                    .clone()
                    .ok_or_else(|| "agent is not holding an object".to_string())?;
                let receptacle = &self.objects[idx];
                if !receptacle.receptacle {
                    return Err(format!("{object_id} is not a receptacle"));
                }
                if receptacle.openable && !receptacle.is_open {
                    return Err(format!("{object_id} is closed"));
                }
                let position = receptacle.position;
                if let Some(h) = self.object_index(&held) {
                    let obj = &mut self.objects[h];
                    obj.held_by = None;
                    obj.position = position;
                    obj.parent = Some(object_id);
                }
                self.agents[agent].held = None;
            }
            Action::SliceObject { .. } => {
                let obj = &mut self.objects[idx];
                if !obj.sliceable || obj.is_sliced {
                    return Err(format!("{object_id} cannot be sliced"));
                }
                obj.is_sliced = true;
                obj.removed = true;
                let slice_type = format!("{}Sliced", obj.object_type);
                let position = obj.position;
                for n in 1..=2 {
                    self.objects.push(
                        MockObject::new(
                            &format!("{object_id}|{slice_type}_{n}"),
                            &slice_type,
                            position,
                        )
                        .pickupable(),
                    );
                }
            }
            Action::OpenObject { .. } | Action::CloseObject { .. } => {
                let open = matches!(action, Action::OpenObject { .. });
                let obj = &mut self.objects[idx];
                if !obj.openable {
                    return Err(format!("{object_id} is not openable"));
                }
                if obj.is_open == open {
                    return Err(format!("{object_id} is already {}", if open { "open" } else { "closed" }));
                }
                obj.is_open = open;
            }
            Action::ToggleObjectOn { .. } | Action::ToggleObjectOff { .. } => {
                let on = matches!(action, Action::ToggleObjectOn { .. });
                let obj = &mut self.objects[idx];
                if !obj.toggleable {
                    return Err(format!("{object_id} is not toggleable"));
                }
                if obj.is_toggled == on {
                    return Err(format!("{object_id} is already {}", if on { "on" } else { "off" }));
                }
                obj.is_toggled = on;
            }
            Action::CleanObject { .. } => {
                let obj = &mut self.objects[idx];
                if !obj.is_dirty {
                    return Err(format!("{object_id} is not dirty"));
                }
                obj.is_dirty = false;
            }
            _ => {}
        }
        Ok(())
    }

    fn apply(&mut self, agent: usize, action: &Action) -> Result<ActionReturn, String> {
        match action {
            Action::GetReachablePositions => Ok(ActionReturn::Positions(self.reachable())),
            Action::GetInteractablePoses { object_id } => {
                let idx = self
                    .object_index(object_id)
                    .ok_or_else(|| format!("object {object_id} does not exist"))?;
                Ok(ActionReturn::Poses(self.interactable_poses(&self.objects[idx])))
            }
            Action::GetShortestPathToPoint { from, target } => {
                if !self.shortest_path {
                    return Err("path query unavailable".into());
                }
                self.shortest_path(from, target)
                    .map(ActionReturn::Path)
                    .ok_or_else(|| "no path to target".into())
            }
            Action::MoveAhead { magnitude } => {
                let yaw = self.agents[agent].pose.yaw;
                self.try_move(agent, yaw, *magnitude).map(|_| ActionReturn::None)
            }
            Action::MoveBack { magnitude } => {
                let yaw = self.agents[agent].pose.yaw + 180.0;
                self.try_move(agent, yaw, *magnitude).map(|_| ActionReturn::None)
            }
            Action::RotateLeft { degrees } | Action::RotateRight { degrees } => {
                let sign = if matches!(action, Action::RotateLeft { .. }) { -1.0 } else { 1.0 };
                let pose = &mut self.agents[agent].pose;
                *pose = Pose::new(pose.position, pose.yaw + sign * degrees, pose.horizon);
                Ok(ActionReturn::None)
            }
            Action::LookUp { degrees } | Action::LookDown { degrees } => {
                let sign = if matches!(action, Action::LookUp { .. }) { -1.0 } else { 1.0 };
                let pose = &mut self.agents[agent].pose;
                let horizon = pose.horizon + sign * degrees;
                if !(MIN_HORIZON - 1e-3..=MAX_HORIZON + 1e-3).contains(&horizon) {
                    return Err(format!("horizon {horizon} out of range"));
                }
                pose.horizon = horizon;
                Ok(ActionReturn::None)
            }
            Action::Teleport { pose } => {
                if !self.layout.walkable(&pose.position) {
                    return Err("teleport target is not walkable".into());
                }
                self.agents[agent].pose = Pose::new(pose.position, pose.yaw, pose.horizon);
                Ok(ActionReturn::None)
            }
            _ => self.interact(agent, action).map(|_| ActionReturn::None),
        }
    }

    fn take_forced_failure(&mut self, agent: usize, action: &str) -> bool {
        match self.forced_failures.get_mut(&(agent, action.to_string())) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

impl Simulator for MockSimulator {
    fn reset(&mut self, _scene: &str, agent_count: usize) -> Result<(), SimError> {
        self.objects = self.initial_objects.clone();
        self.agents = (0..agent_count)
            .map(|i| MockAgent {
                pose: self.start_pose(i),
                held: None,
            })
            .collect();
        self.loaded = true;
        self.stopped = false;
        Ok(())
    }

    fn step(&mut self, agent: AgentId, action: &Action) -> Result<ActionResult, SimError> {
        self.agent(agent)?;
        let outcome = if self.take_forced_failure(agent.0, action.name()) {
            Err(format!("{} failed (forced)", action.name()))
        } else {
            self.apply(agent.0, action)
        };
        let (success, error_message, action_return) = match outcome {
            Ok(ret) => (true, None, ret),
            Err(msg) => (false, Some(msg), ActionReturn::None),
        };
        Ok(ActionResult {
            success,
            error_message,
            action_return,
            metadata: self.build_metadata(agent.0),
        })
    }

    fn metadata(&self, agent: AgentId) -> Result<SceneMetadata, SimError> {
        self.agent(agent)?;
        Ok(self.build_metadata(agent.0))
    }

    fn agent_count(&self) -> usize {
        self.agents.len()
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.loaded = false;
    }
}
