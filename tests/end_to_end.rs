use std::collections::BTreeMap;

use thor_core_lib::mock::MockSimulator;
use thor_core_lib::{
    observability, AgentId, FrameSink, KeywordPlanner, Orchestrator, SceneSession, TaskError, ThorConfig,
};

/// Counts captured frames per agent.
#[derive(Default)]
struct FrameCounter {
    frames: BTreeMap<AgentId, u64>,
    last_round: u64,
}

impl FrameSink for FrameCounter {
    fn capture(&mut self, round: u64, agent: AgentId, _session: &SceneSession) {
        *self.frames.entry(agent).or_default() += 1;
        self.last_round = self.last_round.max(round);
    }
}

/// Spawn points that keep the three agents in separate parts of the kitchen.
fn config() -> ThorConfig {
    let mut config = ThorConfig::default();
    config.orchestrator.start_positions = vec![
        [1.5, 0.91, -1.0],
        [1.5, 0.91, 1.5],
        [-1.5, 0.91, 0.5],
    ];
    config
}

fn kitchen() -> SceneSession {
    SceneSession::create(Box::new(MockSimulator::kitchen()), "FloorPlan1", 1).unwrap()
}

#[tokio::test]
async fn three_agents_finish_a_mixed_english_command() {
    observability::init();
    let orch = Orchestrator::new(config(), Box::new(KeywordPlanner)).unwrap();
    let mut session = kitchen();
    let mut frames = FrameCounter::default();

    let summary = orch
        .run_command(
            &mut session,
            "Heat the bread, turn off the light, and slice the tomato and put it in the fridge",
            &mut frames,
        )
        .await
        .unwrap();

    let kinds: Vec<&str> = summary.reports.iter().map(|r| r.kind.as_str()).collect();
    assert_eq!(kinds, ["heat_object", "toggle_light", "slice_and_store"]);
    assert!(summary.all_succeeded(), "{:#?}", summary.reports);
    assert_eq!(summary.agents.len(), 3);

    let agents: Vec<Option<AgentId>> = summary.reports.iter().map(|r| r.agent).collect();
    assert_eq!(agents, [Some(AgentId(0)), Some(AgentId(1)), Some(AgentId(2))]);

    // heat and slice both end with the object put away
    assert!(summary.agents.iter().all(|a| a.held_object.is_none() && a.task.is_none()));
    assert!(frames.last_round <= summary.rounds);
    assert_eq!(frames.frames.len(), 3);

    // no agent ever issued two mutating actions in one round
    for round in 1..=summary.rounds {
        for agent in 0..3 {
            assert!(session.mutating_actions_in(round, AgentId(agent)) <= 1);
        }
    }

    let light = session
        .observe(AgentId(0))
        .unwrap()
        .objects
        .into_iter()
        .find(|o| o.object_type == "LightSwitch")
        .unwrap();
    assert!(!light.is_toggled);
}

#[tokio::test]
async fn korean_command_is_planned_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.orchestrator.report_store = Some(dir.path().join("reports"));
    let orch = Orchestrator::new(config, Box::new(KeywordPlanner)).unwrap();
    let mut session = kitchen();

    let summary = orch
        .run_command(
            &mut session,
            "빵을 데우고, 불을 끄고, 토마토를 썰어서 냉장고에 넣어줘",
            &mut thor_core_lib::NoopFrameSink,
        )
        .await
        .unwrap();

    assert_eq!(summary.reports.len(), 3);
    assert!(summary.all_succeeded(), "{:#?}", summary.reports);

    let stored = orch.store().unwrap().since(0).unwrap();
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|r| r.success));
    orch.shutdown(session);
}

#[tokio::test]
async fn command_without_a_known_task_is_rejected_before_spawning() {
    let orch = Orchestrator::new(config(), Box::new(KeywordPlanner)).unwrap();
    let mut session = kitchen();

    let err = orch
        .run_command(&mut session, "sing me a song", &mut thor_core_lib::NoopFrameSink)
        .await
        .unwrap_err();

    assert!(matches!(err, TaskError::PlanningUnavailable(_)));
    assert_eq!(session.agent_count(), 1);
    assert!(session.action_log().is_empty());
}
