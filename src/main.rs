//! Jobmate - Rust 求职智能体系统
//!
//! 入口：初始化日志与配置，装配能力注册表 / 故障转移链 / 管线状态机，
//! 然后在标准输入上跑一个简单的对话循环。

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use jobmate::agents::{
    ApplicationAgent, CapabilityRegistry, CoordinatorAgent, InterviewAgent, JobSearchAgent,
    RecordingMailer, ResumeAgent, StaticContactDirectory, StaticJobBoard,
};
use jobmate::llm::{create_deepseek_client, Candidate, FailoverChain, LlmClient, OpenAiClient};
use jobmate::orchestrator::{ApprovalGate, Approvals, TaskGraphExecutor};
use jobmate::pipeline::{
    Brain, PipelineMachine, PipelineStore, PlainTextProfileExtractor, StageRunner, UploadedFile,
};
use jobmate::store::create_store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobmate::observability::init();

    let cfg = jobmate::load_config(None).context("Failed to load config")?;
    let store = create_store(cfg.app.db_path.as_deref());

    // 故障转移链：配置里按优先级排列的 (backend, model) 候选
    let mut candidates = Vec::new();
    for fb in &cfg.llm.fallbacks {
        let client: Arc<dyn LlmClient> = match fb.backend.as_str() {
            "openai" => Arc::new(OpenAiClient::new(None, &fb.model, None)),
            _ => Arc::new(create_deepseek_client(Some(&fb.model))),
        };
        candidates.push(Candidate {
            backend: fb.backend.clone(),
            model: fb.model.clone(),
            client,
        });
    }
    let chain = Arc::new(
        FailoverChain::new(candidates)
            .with_timeout(std::time::Duration::from_secs(cfg.llm.request_timeout_secs)),
    );

    let approvals = Arc::new(Approvals::new(store.clone(), cfg.approval.ttl_secs));
    let mut registry = CapabilityRegistry::new();
    registry.register(CoordinatorAgent);
    registry.register(JobSearchAgent::new(
        Arc::new(StaticJobBoard::with_samples()),
        chain.clone(),
    ));
    registry.register(ResumeAgent::new(chain.clone()));
    registry.register(InterviewAgent::new(chain.clone()));
    registry.register(ApplicationAgent::new(
        store.clone(),
        Arc::new(RecordingMailer::new()),
        Arc::new(StaticContactDirectory::empty()),
        approvals,
    ));
    let registry = Arc::new(registry);

    let executor = Arc::new(TaskGraphExecutor::new(registry.clone(), store.clone()));
    let gate = Arc::new(ApprovalGate::new(
        store.clone(),
        executor,
        cfg.approval.plan_ttl_secs,
    ));
    let states = Arc::new(PipelineStore::new(store));
    let runner = Arc::new(StageRunner::new(registry, states.clone(), gate.clone()));
    let machine = PipelineMachine::new(
        states,
        runner,
        Brain::new(chain),
        gate,
        Arc::new(PlainTextProfileExtractor),
    );

    let name = cfg.app.name.as_deref().unwrap_or("jobmate");
    println!(
        "{} ready. Type a message, '/upload <file>' to attach your CV, '/quit' to exit.",
        name
    );

    let user_id = "local";
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("stdin read failed")? {
        let line = line.trim().to_string();
        if line == "/quit" || line == "/exit" {
            break;
        }

        let (message, attached) = match line.strip_prefix("/upload ") {
            Some(path) => {
                let path = path.trim();
                match tokio::fs::read_to_string(path).await {
                    Ok(content) => (
                        String::new(),
                        Some(UploadedFile {
                            name: path.to_string(),
                            content,
                        }),
                    ),
                    Err(err) => {
                        eprintln!("cannot read '{}': {}", path, err);
                        continue;
                    }
                }
            }
            None => (line, None),
        };

        match machine.chat(user_id, &message, attached).await {
            Ok(reply) => println!("[{:?}] {}", reply.stage, reply.message),
            Err(err) => eprintln!("error: {}", err),
        }
    }

    Ok(())
}
