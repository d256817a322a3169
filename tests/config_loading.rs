use std::io::Write;

use hivemind_core::config::{ExecutionMode, GraphSpec, HivemindConfig};
use hivemind_core::error::HivemindError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_parallel = 8
execution_timeout_secs = 120
node_timeout_secs = 30
mode = "parallel"
step_attempts = 2
entry_agent = "researcher"
aggregator_agent = "editor"

[handoff]
max_handoffs = 4
max_agent_repeats = 2
repetitive_window = 4

[approval]
timeout_secs = 60
sensitive_tools = ["code_execution"]

[circuit]
failure_threshold = 5
recovery_timeout_secs = 10

[hub]
channel_capacity = 128
retention_secs = 30

[[agents]]
id = "researcher"
role = "Find and summarize sources"
successors = ["writer"]

[[agents]]
id = "writer"
role = "Write the article"
successors = ["editor"]
max_iterations = 2

[[agents]]
id = "editor"
role = "Tighten the prose"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = HivemindConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_parallel, 8);
    assert_eq!(config.engine.mode, ExecutionMode::Parallel);
    assert_eq!(config.engine.step_attempts, 2);
    assert_eq!(config.engine.entry_agent.as_deref(), Some("researcher"));
    assert_eq!(config.engine.aggregator_agent.as_deref(), Some("editor"));
    assert_eq!(config.handoff.max_handoffs, 4);
    assert_eq!(config.handoff.min_unique_agents, 2);
    assert_eq!(config.approval.timeout_secs, 60);
    assert_eq!(config.approval.dedupe_window_secs, 10);
    assert_eq!(config.approval.sensitive_tools, vec!["code_execution"]);
    assert_eq!(config.circuit.failure_threshold, 5);
    assert_eq!(config.hub.channel_capacity, 128);

    assert_eq!(config.agents.len(), 3);
    let writer = config.profile("writer").expect("writer profile");
    assert_eq!(writer.successors, vec!["editor"]);
    assert_eq!(writer.max_iterations, 2);
    assert_eq!(config.profile("editor").unwrap().max_iterations, 3);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("HIVEMIND_TEST_PARALLEL", "6");

    let toml_content = r#"
[engine]
max_parallel = ${HIVEMIND_TEST_PARALLEL}
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = HivemindConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.engine.max_parallel, 6);

    std::env::remove_var("HIVEMIND_TEST_PARALLEL");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\n").expect("write toml");

    let config = HivemindConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_parallel, 4);
    assert_eq!(config.engine.execution_timeout_secs, 1800);
    assert_eq!(config.engine.mode, ExecutionMode::Auto);
    assert!(config.engine.entry_agent.is_none());
    assert_eq!(config.handoff.max_agent_repeats, 3);
    assert_eq!(config.approval.timeout_secs, 300);
    assert_eq!(
        config.approval.sensitive_tools,
        vec!["code_execution", "file_write", "browser_automation"]
    );
    assert_eq!(config.circuit.recovery_timeout_secs, 30);
    assert!(config.agents.is_empty());
}

#[test]
fn test_invalid_values_are_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\nmax_parallel = 0\n").expect("write toml");

    let err = HivemindConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, HivemindError::Config(ref msg) if msg.contains("max_parallel")));

    let mut dup = tempfile::NamedTempFile::new().expect("create temp file");
    dup.write_all(b"[[agents]]\nid = \"a\"\n\n[[agents]]\nid = \"a\"\n")
        .expect("write toml");
    assert!(HivemindConfig::load(dup.path()).is_err());
}

#[test]
fn test_missing_config_file() {
    let err = HivemindConfig::load(std::path::Path::new("/nonexistent/hivemind.toml")).unwrap_err();
    assert!(matches!(err, HivemindError::ConfigNotFound(_)));
}

#[test]
fn test_graph_file_loading() {
    let toml_content = r#"
[[nodes]]
id = "research"
agent = "researcher"
task = "Collect sources"
critical = true

[[nodes]]
id = "draft"
agent = "writer"
task = "Write a draft"
depends_on = ["research"]
timeout_secs = 45
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let spec = GraphSpec::load(tmp.path()).expect("load graph");
    assert_eq!(spec.nodes.len(), 2);
    assert!(spec.nodes[0].critical);
    assert_eq!(spec.nodes[1].depends_on, vec!["research"]);
    assert_eq!(spec.nodes[1].timeout_secs, Some(45));
    assert!(!spec.nodes[1].critical);
}
