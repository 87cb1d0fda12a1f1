//! The planning oracle boundary.
//!
//! An oracle turns a natural-language command into free text that should contain a JSON plan:
//!
//! ```json
//! {"tasks": [{"type": "heat_object", "description": "...", "parameters": {"object": "Bread"},
//!             "depends_on": []}],
//!  "num_agents": 1, "reasoning": "..."}
//! ```
//!
//! [`parse_plan`] extracts and validates that JSON against the closed [`TaskKind`] schema. Any
//! violation is a `PlanningMalformed` error and no task is created from a partial plan.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::TaskError;
use crate::session::SceneSession;
use crate::simulator::AgentId;
use crate::task::{TaskKind, TaskSpec};

/// What the oracle may know about the scene when planning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanningContext {
    pub scene: String,
    /// Object types present in the scene, sorted and deduplicated.
    pub object_types: Vec<String>,
    pub max_agents: usize,
}

impl PlanningContext {
    pub fn from_session(session: &SceneSession, max_agents: usize) -> Result<Self, TaskError> {
        let meta = session.observe(AgentId(0))?;
        let mut object_types: Vec<String> = meta.objects.into_iter().map(|o| o.object_type).collect();
        object_types.sort();
        object_types.dedup();
        Ok(Self {
            scene: session.scene().to_string(),
            object_types,
            max_agents,
        })
    }
}

/// Decomposes a command into a raw, JSON-bearing answer. Best effort and non-deterministic.
#[async_trait]
pub trait PlanningOracle: Send + Sync {
    async fn propose(&self, command: &str, context: &PlanningContext) -> Result<String, String>;
}

/// A validated plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<TaskSpec>,
    /// Agents to spawn: at least one, never more than tasks or the configured cap.
    pub num_agents: usize,
    pub reasoning: Option<String>,
}

#[derive(Deserialize)]
struct RawPlan {
    tasks: Vec<RawTask>,
    #[serde(default)]
    num_agents: Option<usize>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Deserialize)]
struct RawTask {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Value,
    #[serde(default)]
    depends_on: Vec<usize>,
}

/// Finds the JSON object in an oracle answer: a fenced code block if present, otherwise the
/// span from the first `{` to the last `}`.
pub fn extract_json(text: &str) -> Option<&str> {
    for fence in ["```json", "```"] {
        if let Some(start) = text.find(fence) {
            let body = &text[start + fence.len()..];
            if let Some(end) = body.find("```") {
                let inner = body[..end].trim();
                if inner.starts_with('{') {
                    return Some(inner);
                }
            }
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn malformed(message: impl Into<String>) -> TaskError {
    TaskError::PlanningMalformed(message.into())
}

fn validate_kind(index: usize, kind: &TaskKind) -> Result<(), TaskError> {
    let names: Vec<&str> = match kind {
        TaskKind::SliceAndStore {
            source_object,
            target_object,
        } => vec![source_object.as_str(), target_object.as_str()],
        TaskKind::ToggleLight { .. } => Vec::new(),
        TaskKind::HeatObject { object } | TaskKind::CleanObject { object } => vec![object.as_str()],
    };
    if names.iter().any(|n| n.trim().is_empty()) {
        return Err(malformed(format!("task {index}: empty object name")));
    }
    Ok(())
}

/// Validates an oracle answer into a [`Plan`], capping the agent count at `max_agents`.
pub fn parse_plan(answer: &str, max_agents: usize) -> Result<Plan, TaskError> {
    let body = extract_json(answer).ok_or_else(|| malformed("no JSON object in oracle output"))?;
    let raw: RawPlan = serde_json::from_str(body).map_err(|e| malformed(e.to_string()))?;
    if raw.tasks.is_empty() {
        return Err(malformed("plan contains no tasks"));
    }

    let mut tasks = Vec::with_capacity(raw.tasks.len());
    for (index, task) in raw.tasks.into_iter().enumerate() {
        let kind_name = task
            .kind
            .ok_or_else(|| malformed(format!("task {index} has no type")))?;
        let kind: TaskKind = serde_json::from_value(json!({
            "type": kind_name,
            "parameters": task.parameters,
        }))
        .map_err(|e| malformed(format!("task {index} ({kind_name}): {e}")))?;
        validate_kind(index, &kind)?;

        if let Some(bad) = task.depends_on.iter().find(|d| **d >= index) {
            return Err(malformed(format!(
                "task {index} depends on {bad}, which is not an earlier task"
            )));
        }

        let description = task
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| kind.name().to_string());
        tasks.push(TaskSpec {
            kind,
            description,
            depends_on: task.depends_on,
        });
    }

    let num_agents = raw
        .num_agents
        .unwrap_or(tasks.len())
        .min(tasks.len())
        .min(max_agents)
        .max(1);
    tracing::info!(tasks = tasks.len(), num_agents, "plan accepted");
    Ok(Plan {
        tasks,
        num_agents,
        reasoning: raw.reasoning,
    })
}

const SLICE_WORDS: &[&str] = &["slice", "cut", "chop", "썰", "자르", "잘라"];
const HEAT_WORDS: &[&str] = &["heat", "warm", "microwave", "데우", "데워", "전자레인지"];
const CLEAN_WORDS: &[&str] = &["clean", "wash", "rinse", "씻", "닦", "세척"];
const LIGHT_WORDS: &[&str] = &["light", "lamp", "조명", "전등", "불"];
const OFF_WORDS: &[&str] = &["off", "끄", "꺼", "끈"];

const OBJECTS: &[(&str, &str)] = &[
    ("tomato", "Tomato"),
    ("토마토", "Tomato"),
    ("bread", "Bread"),
    ("빵", "Bread"),
    ("apple", "Apple"),
    ("사과", "Apple"),
    ("potato", "Potato"),
    ("감자", "Potato"),
    ("lettuce", "Lettuce"),
    ("양상추", "Lettuce"),
    ("egg", "Egg"),
    ("계란", "Egg"),
    ("달걀", "Egg"),
    ("plate", "Plate"),
    ("접시", "Plate"),
    ("mug", "Mug"),
    ("머그", "Mug"),
    ("cup", "Cup"),
    ("컵", "Cup"),
];

const RECEPTACLES: &[(&str, &str)] = &[
    ("fridge", "Fridge"),
    ("refrigerator", "Fridge"),
    ("냉장고", "Fridge"),
    ("cabinet", "Cabinet"),
    ("찬장", "Cabinet"),
    ("drawer", "Drawer"),
    ("서랍", "Drawer"),
];

/// A rule-based stand-in for an LLM planner.
///
/// Recognises the four task kinds from English and Korean keywords and answers with the same
/// JSON an LLM would produce, so it exercises the full validation path.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordPlanner;

fn first_match(text: &str, words: &[&str]) -> Option<usize> {
    words.iter().filter_map(|w| text.find(w)).min()
}

fn nearest(text: &str, at: usize, table: &[(&str, &'static str)]) -> Option<&'static str> {
    table
        .iter()
        .flat_map(|(word, name)| text.match_indices(word).map(move |(i, _)| (i.abs_diff(at), *name)))
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, name)| name)
}

impl KeywordPlanner {
    fn plan(&self, command: &str) -> Vec<(usize, Value)> {
        let text = command.to_lowercase();
        let mut found = Vec::new();

        if let Some(at) = first_match(&text, SLICE_WORDS) {
            if let Some(source) = nearest(&text, at, OBJECTS) {
                let target = nearest(&text, at, RECEPTACLES).unwrap_or("Fridge");
                found.push((
                    at,
                    json!({
                        "type": "slice_and_store",
                        "description": format!("Slice the {source} and store it in the {target}"),
                        "parameters": { "source_object": source, "target_object": target },
                    }),
                ));
            }
        }
        if let Some(at) = first_match(&text, HEAT_WORDS) {
            if let Some(object) = nearest(&text, at, OBJECTS) {
                found.push((
                    at,
                    json!({
                        "type": "heat_object",
                        "description": format!("Heat the {object} in the microwave"),
                        "parameters": { "object": object },
                    }),
                ));
            }
        }
        if let Some(at) = first_match(&text, CLEAN_WORDS) {
            if let Some(object) = nearest(&text, at, OBJECTS) {
                found.push((
                    at,
                    json!({
                        "type": "clean_object",
                        "description": format!("Clean the {object} in the sink"),
                        "parameters": { "object": object },
                    }),
                ));
            }
        }
        if let Some(at) = first_match(&text, LIGHT_WORDS) {
            let action = if first_match(&text, OFF_WORDS).is_some() { "off" } else { "on" };
            found.push((
                at,
                json!({
                    "type": "toggle_light",
                    "description": format!("Turn the light {action}"),
                    "parameters": { "action": action },
                }),
            ));
        }

        found.sort_by_key(|(at, _)| *at);
        found
    }
}

fn task_object(task: &Value) -> Option<&str> {
    let params = task.get("parameters")?;
    params
        .get("object")
        .or_else(|| params.get("source_object"))
        .and_then(Value::as_str)
}

#[async_trait]
impl PlanningOracle for KeywordPlanner {
    async fn propose(&self, command: &str, context: &PlanningContext) -> Result<String, String> {
        let mut tasks: Vec<Value> = self.plan(command).into_iter().map(|(_, t)| t).collect();
        if tasks.is_empty() {
            return Err("No planning rule matched this command (keyword planner).".to_string());
        }

        // a later task touching the same object waits for the earlier one
        for index in 0..tasks.len() {
            let object = task_object(&tasks[index]).map(str::to_string);
            let depends_on: Vec<usize> = (0..index)
                .filter(|earlier| object.is_some() && task_object(&tasks[*earlier]).map(str::to_string) == object)
                .collect();
            tasks[index]["depends_on"] = json!(depends_on);
        }

        let num_agents = tasks.len().min(context.max_agents.max(1));
        tracing::debug!(tasks = tasks.len(), scene = %context.scene, "keyword plan");
        Ok(json!({
            "tasks": tasks,
            "num_agents": num_agents,
            "reasoning": "keyword match",
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::LightAction;

    fn context() -> PlanningContext {
        PlanningContext {
            scene: "FloorPlan1".into(),
            object_types: Vec::new(),
            max_agents: 3,
        }
    }

    #[test]
    fn extracts_fenced_json() {
        let text = "Here is the plan:\n```json\n{\"tasks\": []}\n```\nDone.";
        assert_eq!(extract_json(text), Some("{\"tasks\": []}"));
        assert_eq!(extract_json("prefix {\"a\": {\"b\": 1}} suffix"), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn parses_a_valid_plan_and_caps_agents() {
        let answer = r#"```json
        {"tasks": [
            {"type": "heat_object", "parameters": {"object": "Bread"}},
            {"type": "toggle_light", "description": "lights out", "parameters": {"action": "끄기"}},
            {"type": "clean_object", "parameters": {"object": "Plate"}, "depends_on": [0]},
            {"type": "slice_and_store", "parameters": {"source_object": "Tomato", "target_object": "Fridge"}}
        ], "num_agents": 8, "reasoning": "parallel"}
        ```"#;
        let plan = parse_plan(answer, 3).unwrap();
        assert_eq!(plan.tasks.len(), 4);
        assert_eq!(plan.num_agents, 3);
        assert_eq!(plan.tasks[0].description, "heat_object");
        assert_eq!(plan.tasks[1].kind, TaskKind::ToggleLight { action: LightAction::Off });
        assert_eq!(plan.tasks[2].depends_on, vec![0]);
    }

    #[test]
    fn missing_type_is_malformed() {
        let err = parse_plan(r#"{"tasks": [{"parameters": {"object": "Bread"}}]}"#, 3).unwrap_err();
        assert!(matches!(err, TaskError::PlanningMalformed(ref m) if m.contains("no type")));
    }

    #[test]
    fn unknown_kind_and_bad_parameters_are_malformed() {
        for answer in [
            r#"{"tasks": [{"type": "juggle", "parameters": {}}]}"#,
            r#"{"tasks": [{"type": "heat_object", "parameters": {"thing": "Bread"}}]}"#,
            r#"{"tasks": [{"type": "toggle_light", "parameters": {"action": "dim"}}]}"#,
            r#"{"tasks": [{"type": "clean_object", "parameters": {"object": " "}}]}"#,
            r#"{"tasks": []}"#,
            r#"{"plan": "none"}"#,
        ] {
            assert!(
                matches!(parse_plan(answer, 3), Err(TaskError::PlanningMalformed(_))),
                "{answer}"
            );
        }
    }

    #[test]
    fn forward_or_self_dependencies_are_malformed() {
        let answer = r#"{"tasks": [
            {"type": "heat_object", "parameters": {"object": "Bread"}, "depends_on": [1]},
            {"type": "clean_object", "parameters": {"object": "Plate"}}
        ]}"#;
        assert!(matches!(parse_plan(answer, 3), Err(TaskError::PlanningMalformed(_))));

        let answer = r#"{"tasks": [{"type": "heat_object", "parameters": {"object": "Bread"}, "depends_on": [0]}]}"#;
        assert!(matches!(parse_plan(answer, 3), Err(TaskError::PlanningMalformed(_))));
    }

    #[tokio::test]
    async fn keyword_planner_reads_english_commands() {
        let answer = KeywordPlanner
            .propose("Heat the bread, turn off the light, and slice the tomato into the fridge", &context())
            .await
            .unwrap();
        let plan = parse_plan(&answer, 3).unwrap();
        let kinds: Vec<&str> = plan.tasks.iter().map(|t| t.kind.name()).collect();
        assert_eq!(kinds, ["heat_object", "toggle_light", "slice_and_store"]);
        assert_eq!(plan.tasks[0].kind, TaskKind::HeatObject { object: "Bread".into() });
        assert_eq!(plan.tasks[1].kind, TaskKind::ToggleLight { action: LightAction::Off });
        assert_eq!(plan.num_agents, 3);
    }

    #[tokio::test]
    async fn keyword_planner_reads_korean_commands() {
        let answer = KeywordPlanner
            .propose("토마토를 썰어서 냉장고에 넣고 불을 켜줘", &context())
            .await
            .unwrap();
        let plan = parse_plan(&answer, 3).unwrap();
        assert_eq!(
            plan.tasks[0].kind,
            TaskKind::SliceAndStore {
                source_object: "Tomato".into(),
                target_object: "Fridge".into()
            }
        );
        assert_eq!(plan.tasks[1].kind, TaskKind::ToggleLight { action: LightAction::On });
    }

    #[tokio::test]
    async fn keyword_planner_chains_tasks_on_the_same_object() {
        let answer = KeywordPlanner
            .propose("wash the plate, then heat the plate", &context())
            .await
            .unwrap();
        let plan = parse_plan(&answer, 3).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].depends_on, vec![0]);
    }

    #[tokio::test]
    async fn keyword_planner_rejects_unrelated_commands() {
        assert!(KeywordPlanner.propose("sing a song", &context()).await.is_err());
    }
}
