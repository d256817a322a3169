use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use hivemind_core::config::{ExecutionMode, HivemindConfig};
use hivemind_core::event::StartFrom;
use hivemind_core::frame::{Channel, ControlType};
use hivemind_core::types::ExecutionId;
use hivemind_engine::{DagOrchestrator, ExecutionStatus, GraphNode, NodeStatus};
use hivemind_test_utils::{control_events, position_of, shared, ScriptedAgent, ScriptedTool};

fn swarm_config() -> HivemindConfig {
    let mut config = HivemindConfig::default();
    config.engine.mode = ExecutionMode::Parallel;
    config.engine.initial_backoff_ms = 10;
    config.engine.max_backoff_ms = 20;
    config
}

async fn wait_for_approval(orchestrator: &DagOrchestrator, execution_id: &ExecutionId) -> String {
    loop {
        if let Some(request) = orchestrator
            .approvals()
            .list_pending(Some(execution_id))
            .await
            .into_iter()
            .next()
        {
            return request.id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn sensitive_tool_call_waits_for_approval() {
    let coder = shared(
        ScriptedAgent::new("coder")
            .with_result("patched")
            .with_tool_call("code_execution", json!({"cmd": "cargo fmt"})),
    );
    let tool = Arc::new(ScriptedTool::new("code_execution", json!("ok")));
    let mut orchestrator = DagOrchestrator::new(swarm_config());
    orchestrator.register_agent(coder.clone());
    orchestrator.tools().register(tool.clone()).await;
    let orchestrator = Arc::new(orchestrator);

    let graph = orchestrator
        .build_graph(vec![GraphNode::new("fix", "coder", "Format the code")])
        .unwrap();
    let execution_id = ExecutionId::from_str("approve");

    let run = {
        let orchestrator = orchestrator.clone();
        let execution_id = execution_id.clone();
        tokio::spawn(async move { orchestrator.execute(&execution_id, &graph).await })
    };

    let approval_id = wait_for_approval(&orchestrator, &execution_id).await;
    assert_eq!(tool.calls(), 0);
    assert!(
        orchestrator
            .approvals()
            .resolve_approval(&approval_id, true, None, Some("looks safe".into()))
            .await
    );

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output.as_deref(), Some("patched [code_execution: \"ok\"]"));
    assert_eq!(tool.calls(), 1);

    let control = orchestrator
        .hub()
        .snapshot(&execution_id, Channel::Control, StartFrom::Start)
        .await
        .unwrap();
    let kinds: Vec<ControlType> = control
        .iter()
        .filter_map(|e| e.frame.as_control())
        .map(|c| c.kind)
        .collect();
    let requested = kinds.iter().position(|k| *k == ControlType::ApprovalRequested);
    let resolved = kinds.iter().position(|k| *k == ControlType::ApprovalResolved);
    assert!(requested.is_some() && requested < resolved);
}

#[tokio::test]
async fn rejected_tool_call_lets_the_agent_continue() {
    let coder = shared(
        ScriptedAgent::new("coder")
            .with_result("skipped")
            .with_tool_call("file_write", json!({"path": "/etc/passwd"})),
    );
    let tool = Arc::new(ScriptedTool::new("file_write", json!("written")));
    let mut orchestrator = DagOrchestrator::new(swarm_config());
    orchestrator.register_agent(coder.clone());
    orchestrator.tools().register(tool.clone()).await;
    let orchestrator = Arc::new(orchestrator);
    let graph = orchestrator
        .build_graph(vec![GraphNode::new("w", "coder", "Write a file")])
        .unwrap();
    let execution_id = ExecutionId::from_str("reject");

    let run = {
        let orchestrator = orchestrator.clone();
        let execution_id = execution_id.clone();
        tokio::spawn(async move { orchestrator.execute(&execution_id, &graph).await })
    };
    let approval_id = wait_for_approval(&orchestrator, &execution_id).await;
    orchestrator
        .approvals()
        .resolve(&approval_id, false, None, Some("not that file".into()))
        .await;

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output.as_deref(), Some("skipped [file_write: rejected]"));
    assert_eq!(tool.calls(), 0);
}

#[tokio::test]
async fn live_subscription_matches_replay() {
    let researcher = shared(ScriptedAgent::new("researcher").with_tokens(&["a", "b", "c"]));
    let writer = shared(ScriptedAgent::new("writer").with_tokens(&["d", "e"]));
    let mut orchestrator = DagOrchestrator::new(swarm_config());
    orchestrator.register_agent(researcher.clone());
    orchestrator.register_agent(writer.clone());
    let graph = orchestrator
        .build_graph(vec![
            GraphNode::new("r", "researcher", "Research"),
            GraphNode::new("w", "writer", "Write").depends_on(["r"]),
        ])
        .unwrap();
    let execution_id = ExecutionId::from_str("replay");

    orchestrator.hub().open(&execution_id).await;
    let live = orchestrator
        .hub()
        .subscribe(&execution_id, &[Channel::Token], StartFrom::Start)
        .await
        .unwrap();
    let collector = tokio::spawn(live.collect::<Vec<_>>());

    let result = orchestrator.execute(&execution_id, &graph).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);

    let live = collector.await.unwrap();
    let replay = orchestrator
        .hub()
        .snapshot(&execution_id, Channel::Token, StartFrom::Start)
        .await
        .unwrap();
    assert_eq!(live, replay);
    assert_eq!(replay.len(), 5);

    let late = orchestrator
        .hub()
        .snapshot(&execution_id, Channel::Token, StartFrom::Position(4))
        .await
        .unwrap();
    assert_eq!(late.len(), 2);
    assert_eq!(late[0].position, 4);
}

#[tokio::test(start_paused = true)]
async fn sequences_stay_monotonic_across_retries() {
    let flaky = shared(
        ScriptedAgent::new("flaky")
            .with_tokens(&["x", "y"])
            .failing_first(1),
    );
    let mut orchestrator = DagOrchestrator::new(swarm_config());
    orchestrator.register_agent(flaky.clone());
    let graph = orchestrator
        .build_graph(vec![GraphNode::new("n", "flaky", "Try twice")])
        .unwrap();
    let execution_id = ExecutionId::from_str("monotonic");

    let result = orchestrator.execute(&execution_id, &graph).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(flaky.calls(), 2);
    assert_eq!(flaky.requests()[1].first_sequence, 3);

    let tokens = orchestrator
        .hub()
        .snapshot(&execution_id, Channel::Token, StartFrom::Start)
        .await
        .unwrap();
    let seqs: Vec<(u64, bool)> = tokens
        .iter()
        .filter_map(|e| e.frame.as_token())
        .map(|t| (t.sequence, t.is_final))
        .collect();
    assert_eq!(seqs, vec![(1, false), (2, true), (3, false), (4, true)]);
}

#[tokio::test(start_paused = true)]
async fn open_circuit_fails_fast_and_recovers() {
    let mut config = swarm_config();
    config.engine.step_attempts = 1;
    config.circuit.failure_threshold = 2;
    config.circuit.recovery_timeout_secs = 30;

    let broken = shared(ScriptedAgent::new("broken").failing_first(2).with_result("back"));
    let mut orchestrator = DagOrchestrator::new(config);
    orchestrator.register_agent(broken.clone());
    let graph = orchestrator
        .build_graph(vec![GraphNode::new("n", "broken", "Try")])
        .unwrap();

    for i in 0..2 {
        let id = ExecutionId::from_str(&format!("fail-{}", i));
        let result = orchestrator.execute(&id, &graph).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
    }
    assert_eq!(broken.calls(), 2);

    let fast = orchestrator
        .execute(&ExecutionId::from_str("fast"), &graph)
        .await
        .unwrap();
    let node = fast.node("n").unwrap();
    assert_eq!(node.status, NodeStatus::Failed);
    assert!(node.reason.as_deref().unwrap().contains("Circuit open"));
    assert_eq!(broken.calls(), 2);

    tokio::time::advance(Duration::from_secs(31)).await;
    let recovered = orchestrator
        .execute(&ExecutionId::from_str("recovered"), &graph)
        .await
        .unwrap();
    assert_eq!(recovered.status, ExecutionStatus::Completed);
    assert_eq!(recovered.output.as_deref(), Some("back"));
    assert_eq!(broken.calls(), 3);
}

fn fan_in_graph(orchestrator: &DagOrchestrator) -> hivemind_engine::ExecutionGraph {
    orchestrator
        .build_graph(vec![
            GraphNode::new("a", "a", "Survey crates"),
            GraphNode::new("b", "b", "Survey papers"),
            GraphNode::new("c", "c", "Survey blogs"),
            GraphNode::new("d", "d", "Summarize").depends_on(["a", "b", "c"]),
        ])
        .unwrap()
}

fn fan_in_swarm(failing: Option<&str>) -> (DagOrchestrator, Vec<Arc<ScriptedAgent>>) {
    let mut config = swarm_config();
    config.engine.max_parallel = 3;
    config.engine.step_attempts = 1;
    let agents: Vec<Arc<ScriptedAgent>> = ["a", "b", "c", "d"]
        .iter()
        .map(|id| {
            let agent = ScriptedAgent::new(*id)
                .with_result(format!("{id} done"))
                .with_delay(Duration::from_millis(100));
            if failing == Some(*id) {
                shared(agent.always_failing())
            } else {
                shared(agent)
            }
        })
        .collect();
    let mut orchestrator = DagOrchestrator::new(config);
    for agent in &agents {
        orchestrator.register_agent(agent.clone());
    }
    (orchestrator, agents)
}

#[tokio::test(start_paused = true)]
async fn ready_level_starts_together_before_its_dependent() {
    let (orchestrator, _agents) = fan_in_swarm(None);
    let graph = fan_in_graph(&orchestrator);
    let execution_id = ExecutionId::from_str("fan-in");

    let result = orchestrator.execute(&execution_id, &graph).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output.as_deref(), Some("d done"));

    let control = orchestrator
        .hub()
        .snapshot(&execution_id, Channel::Control, StartFrom::Start)
        .await
        .unwrap();
    let events = control_events(&control);
    let started: Vec<usize> = ["a", "b", "c"]
        .iter()
        .map(|id| position_of(&events, ControlType::AgentStarted, id).unwrap())
        .collect();
    let completed: Vec<usize> = ["a", "b", "c"]
        .iter()
        .map(|id| position_of(&events, ControlType::AgentCompleted, id).unwrap())
        .collect();
    let last_start = started.iter().max().unwrap();
    let first_done = completed.iter().min().unwrap();
    assert!(last_start < first_done, "{:?}", events);

    let dependent = position_of(&events, ControlType::AgentStarted, "d").unwrap();
    assert!(completed.iter().all(|done| *done < dependent), "{:?}", events);
}

#[tokio::test(start_paused = true)]
async fn failed_branch_blocks_only_the_fan_in() {
    let (orchestrator, agents) = fan_in_swarm(Some("b"));
    let graph = fan_in_graph(&orchestrator);
    let execution_id = ExecutionId::from_str("fan-in-partial");

    let result = orchestrator.execute(&execution_id, &graph).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Partial);
    assert_eq!(result.node("a").unwrap().status, NodeStatus::Completed);
    assert_eq!(result.node("c").unwrap().status, NodeStatus::Completed);
    assert_eq!(result.node("b").unwrap().status, NodeStatus::Failed);
    let blocked = result.node("d").unwrap();
    assert_eq!(blocked.status, NodeStatus::Blocked);
    assert!(blocked.reason.as_deref().unwrap().contains("'b'"));
    assert_eq!(agents[3].calls(), 0);

    let control = orchestrator
        .hub()
        .snapshot(&execution_id, Channel::Control, StartFrom::Start)
        .await
        .unwrap();
    let events = control_events(&control);
    assert!(position_of(&events, ControlType::AgentStarted, "d").is_none());
    assert!(position_of(&events, ControlType::Error, "b").is_some());
}
