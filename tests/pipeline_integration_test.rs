//! 管线集成测试：从上传到发送走完整条求职流水线

use std::sync::Arc;
use std::time::Duration;

use jobmate::agents::{
    ApplicationAgent, CapabilityRegistry, CoordinatorAgent, JobSearchAgent, RecordingMailer,
    ResumeAgent, StaticContactDirectory, StaticJobBoard,
};
use jobmate::llm::{Candidate, FailoverChain, LlmClient, LlmError, MockLlmClient};
use jobmate::orchestrator::{ApprovalGate, Approvals, TaskGraphExecutor};
use jobmate::pipeline::{
    Brain, PipelineMachine, PipelineStore, PlainTextProfileExtractor, Stage, StageRunner,
    UploadedFile,
};
use jobmate::store::create_store;

fn chain_of(client: impl LlmClient + 'static) -> Arc<FailoverChain> {
    Arc::new(FailoverChain::new(vec![Candidate::new(
        "mock",
        "mock",
        Arc::new(client),
    )]))
}

struct Harness {
    machine: PipelineMachine,
    states: Arc<PipelineStore>,
    mailer: Arc<RecordingMailer>,
}

/// brain_client 驱动大脑决策；能力层的生成类动作用固定文本回复
fn harness(brain_client: impl LlmClient + 'static) -> Harness {
    let store = create_store(None);
    let agent_chain = chain_of(MockLlmClient::always_reply("generated document text"));
    let mailer = Arc::new(RecordingMailer::new());

    let mut registry = CapabilityRegistry::new();
    registry.register(CoordinatorAgent);
    registry.register(JobSearchAgent::new(
        Arc::new(StaticJobBoard::with_samples()),
        agent_chain.clone(),
    ));
    registry.register(ResumeAgent::new(agent_chain));
    registry.register(ApplicationAgent::new(
        store.clone(),
        mailer.clone(),
        Arc::new(StaticContactDirectory::empty()),
        Arc::new(Approvals::new(store.clone(), 3600)),
    ));
    let registry = Arc::new(registry);

    let executor = Arc::new(TaskGraphExecutor::new(registry.clone(), store.clone()));
    let gate = Arc::new(ApprovalGate::new(store.clone(), executor, 3600));
    let states = Arc::new(PipelineStore::new(store));
    let runner = Arc::new(StageRunner::new(registry, states.clone(), gate.clone()));
    let machine = PipelineMachine::new(
        states.clone(),
        runner,
        Brain::new(chain_of(brain_client)),
        gate,
        Arc::new(PlainTextProfileExtractor),
    );

    Harness {
        machine,
        states,
        mailer,
    }
}

fn cv_file() -> UploadedFile {
    UploadedFile {
        name: "cv.txt".to_string(),
        content: "Ada Lovelace\nSkills: Rust, distributed systems\n".to_string(),
    }
}

/// 轮询直到后台阶段落到稳定态
async fn wait_stable(states: &PipelineStore, user: &str) -> Stage {
    for _ in 0..100 {
        let state = states.load(user).await.unwrap();
        if !state.stage.is_async() {
            return state.stage;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pipeline never left its async stage");
}

#[tokio::test]
async fn empty_message_without_profile_returns_welcome() {
    let h = harness(MockLlmClient::new());
    let reply = h.machine.chat("u1", "", None).await.unwrap();
    assert_eq!(reply.stage, Stage::WaitingInput);
    assert!(reply.message.contains("Upload your CV"));
}

#[tokio::test]
async fn file_upload_moves_to_ready() {
    let h = harness(MockLlmClient::new());
    let reply = h.machine.chat("u1", "", Some(cv_file())).await.unwrap();
    assert_eq!(reply.stage, Stage::Ready);
    assert!(reply.message.contains("Ada Lovelace"));

    let state = h.states.load("u1").await.unwrap();
    assert!(state.has_profile());
}

#[tokio::test]
async fn role_and_location_message_starts_searching() {
    let h = harness(MockLlmClient::always_reply(
        r#"{"message": "On it.", "action": "search", "role": "Software Engineer", "location": "Karachi"}"#,
    ));
    h.machine.chat("u1", "", Some(cv_file())).await.unwrap();

    let reply = h
        .machine
        .chat("u1", "Software Engineer Karachi", None)
        .await
        .unwrap();
    assert_eq!(reply.stage, Stage::Searching);

    assert_eq!(wait_stable(&h.states, "u1").await, Stage::Ready);
    let state = h.states.load("u1").await.unwrap();
    assert_eq!(state.jobs.len(), 2);
    assert!(state.error.is_none());
    assert_eq!(state.role.as_deref(), Some("Software Engineer"));
}

#[tokio::test]
async fn async_stage_rejects_new_commands() {
    let h = harness(MockLlmClient::new());
    let mut state = h.states.load("u1").await.unwrap();
    state.stage = Stage::Searching;
    h.states.save("u1", &state).await.unwrap();

    let reply = h.machine.chat("u1", "generate", None).await.unwrap();
    assert_eq!(reply.stage, Stage::Searching);
    assert!(reply.message.contains("Still working"));
}

#[tokio::test]
async fn reset_wins_from_any_stage() {
    let h = harness(MockLlmClient::new());
    let mut state = h.states.load("u1").await.unwrap();
    state.stage = Stage::Sending;
    h.states.save("u1", &state).await.unwrap();

    let reply = h.machine.chat("u1", "reset", None).await.unwrap();
    assert_eq!(reply.stage, Stage::WaitingInput);

    let state = h.states.load("u1").await.unwrap();
    assert!(!state.has_profile());
    assert!(state.history.is_empty());
}

#[tokio::test]
async fn provider_exhausted_serves_static_menu() {
    let h = harness(MockLlmClient::always_fail(LlmError::RateLimited(
        "over quota".to_string(),
    )));
    h.machine.chat("u1", "", Some(cv_file())).await.unwrap();

    let reply = h
        .machine
        .chat("u1", "what should I do next?", None)
        .await
        .unwrap();
    assert_eq!(reply.stage, Stage::Ready);
    assert!(reply.message.contains("'reset'"));
    assert!(reply.message.contains("search"));
}

#[tokio::test]
async fn review_polling_is_idempotent() {
    let h = harness(MockLlmClient::new());
    let mut state = h.states.load("u1").await.unwrap();
    state.stage = Stage::Review1;
    state.generated_artifacts = vec![serde_json::json!({"artifact_type": "cv"})];
    h.states.save("u1", &state).await.unwrap();

    let first = h.machine.chat("u1", "status?", None).await.unwrap();
    let second = h.machine.chat("u1", "status?", None).await.unwrap();
    assert_eq!(first.message, second.message);
    assert_eq!(first.data, second.data);

    let after = h.states.load("u1").await.unwrap();
    assert_eq!(after.stage, Stage::Review1);
    assert!(after.history.is_empty());
}

#[tokio::test]
async fn full_pipeline_sends_only_after_second_approval() {
    let h = harness(MockLlmClient::always_reply(
        r#"{"message": "Searching.", "action": "search", "role": "Software Engineer", "location": "Karachi"}"#,
    ));
    h.machine.chat("u1", "", Some(cv_file())).await.unwrap();

    // 搜索
    h.machine
        .chat("u1", "Software Engineer in Karachi please", None)
        .await
        .unwrap();
    assert_eq!(wait_stable(&h.states, "u1").await, Stage::Ready);

    // 生成（关键词快速匹配，不走大脑）
    let reply = h.machine.chat("u1", "generate", None).await.unwrap();
    assert_eq!(reply.stage, Stage::Generating);
    assert_eq!(wait_stable(&h.states, "u1").await, Stage::Review1);

    // 第一次评审通过 → 找联系人并挂起发送计划
    let reply = h.machine.chat("u1", "approve", None).await.unwrap();
    assert_eq!(reply.stage, Stage::Finding);
    assert_eq!(wait_stable(&h.states, "u1").await, Stage::Review2);
    assert!(h.mailer.sent().is_empty());
    let state = h.states.load("u1").await.unwrap();
    assert!(state.pending_approval_id.is_some());

    // 第二次评审通过才真正外发
    let reply = h.machine.chat("u1", "approve", None).await.unwrap();
    assert_eq!(reply.stage, Stage::Sending);
    assert_eq!(wait_stable(&h.states, "u1").await, Stage::Done);
    assert_eq!(h.mailer.sent().len(), 2);
}

#[tokio::test]
async fn review2_reject_cancels_the_pending_plan() {
    let h = harness(MockLlmClient::always_reply(
        r#"{"message": "Searching.", "action": "search", "role": "Software Engineer", "location": "Karachi"}"#,
    ));
    h.machine.chat("u1", "", Some(cv_file())).await.unwrap();
    h.machine.chat("u1", "find me a job", None).await.unwrap();
    wait_stable(&h.states, "u1").await;
    h.machine.chat("u1", "generate", None).await.unwrap();
    wait_stable(&h.states, "u1").await;
    h.machine.chat("u1", "approve", None).await.unwrap();
    assert_eq!(wait_stable(&h.states, "u1").await, Stage::Review2);

    let reply = h.machine.chat("u1", "reject", None).await.unwrap();
    assert_eq!(reply.stage, Stage::Ready);
    assert!(h.mailer.sent().is_empty());

    let state = h.states.load("u1").await.unwrap();
    assert!(state.pending_approval_id.is_none());
}
