//! 提供商故障转移链
//!
//! 按配置顺序维护（后端, 模型）候选列表；一个游标记录上次全局成功的候选下标，
//! 作为下一次调用的起点向前轮转（跨调用摊销「哪个后端健康」的探测成本）。
//! 可转移错误（限流 / 容量 / 模型下线）换下一候选；其余错误立即上抛；
//! 全部候选失败后以 Exhausted 收尾并携带最后一个错误。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use crate::llm::{LlmClient, LlmError, Message};

/// 一个候选：后端名 + 模型名 + 客户端
pub struct Candidate {
    pub backend: String,
    pub model: String,
    pub client: Arc<dyn LlmClient>,
}

impl Candidate {
    pub fn new(
        backend: impl Into<String>,
        model: impl Into<String>,
        client: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            backend: backend.into(),
            model: model.into(),
            client,
        }
    }
}

/// 故障转移链：持有候选列表与「上次成功」游标（实例状态，非模块级全局量）
pub struct FailoverChain {
    candidates: Vec<Candidate>,
    /// 上次成功候选的下标；下次调用从这里开始尝试
    cursor: AtomicUsize,
    /// 单次候选请求的超时；超时按可转移错误处理，换下一候选
    request_timeout: Option<Duration>,
}

impl FailoverChain {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            cursor: AtomicUsize::new(0),
            request_timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// 当前游标（上次成功候选的下标）
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    /// 依次尝试候选，返回第一个成功的回复
    pub async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let n = self.candidates.len();
        if n == 0 {
            return Err(LlmError::Api("no provider candidates configured".to_string()));
        }

        let start = self.cursor.load(Ordering::Relaxed) % n;
        let mut last_error: Option<LlmError> = None;

        for i in 0..n {
            let idx = (start + i) % n;
            let candidate = &self.candidates[idx];

            let attempt = match self.request_timeout {
                Some(limit) => match tokio::time::timeout(limit, candidate.client.complete(messages)).await {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout(limit)),
                },
                None => candidate.client.complete(messages).await,
            };

            match attempt {
                Ok(text) => {
                    if i > 0 {
                        tracing::info!(
                            backend = %candidate.backend,
                            model = %candidate.model,
                            "provider failover: rotated to healthy candidate"
                        );
                    }
                    self.cursor.store(idx, Ordering::Relaxed);
                    return Ok(text);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        backend = %candidate.backend,
                        model = %candidate.model,
                        "transient provider failure, trying next candidate: {}",
                        e
                    );
                    last_error = Some(e);
                }
                // 编程类错误不掩盖为可转移，立即上抛
                Err(e) => return Err(e),
            }
        }

        Err(LlmError::Exhausted {
            attempts: n,
            last: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// 结构化完成：把目标类型的 JSON Schema 附加到 system 消息，要求仅输出 JSON，
    /// 再对回复做宽容解析（严格 → ```json 围栏 → 最大内嵌 JSON 片段）
    pub async fn complete_structured<T>(&self, messages: &[Message]) -> Result<T, LlmError>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let schema = schemars::schema_for!(T);
        let schema_text =
            serde_json::to_string_pretty(&schema).map_err(|e| LlmError::Parse(e.to_string()))?;

        let mut full = vec![Message::system(format!(
            "Respond with a single JSON object matching this JSON Schema. \
             Output ONLY the JSON, no explanation.\n\n{}",
            schema_text
        ))];
        full.extend(messages.to_vec());

        let raw = self.complete(&full).await?;
        parse_structured(&raw)
    }
}

/// 从 LLM 回复中提取 JSON 片段：```json 围栏优先，否则取最大的 {..} 或 [..] 片段
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let inner = rest
            .find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or_else(|| rest.trim());
        return Some(inner);
    }

    let object = trimmed
        .find('{')
        .and_then(|s| trimmed.rfind('}').filter(|e| *e > s).map(|e| &trimmed[s..=e]));
    let array = trimmed
        .find('[')
        .and_then(|s| trimmed.rfind(']').filter(|e| *e > s).map(|e| &trimmed[s..=e]));

    // 两种片段都存在时取更大的那个
    match (object, array) {
        (Some(o), Some(a)) => Some(if o.len() >= a.len() { o } else { a }),
        (Some(o), None) => Some(o),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

/// 宽容解析：先整体严格解析，失败后退回 extract_json 提取的片段
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, LlmError> {
    if let Ok(parsed) = serde_json::from_str::<T>(raw.trim()) {
        return Ok(parsed);
    }

    let fragment = extract_json(raw)
        .ok_or_else(|| LlmError::Parse(format!("no JSON found in response: {}", raw)))?;

    serde_json::from_str::<T>(fragment)
        .map_err(|e| LlmError::Parse(format!("{}: {}", e, fragment)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use serde::Deserialize;

    fn failing(backend: &str) -> Candidate {
        Candidate::new(
            backend,
            "m",
            Arc::new(MockLlmClient::always_fail(LlmError::RateLimited(
                "429".to_string(),
            ))),
        )
    }

    fn healthy(backend: &str, reply: &str) -> (Candidate, Arc<MockLlmClient>) {
        let client = Arc::new(MockLlmClient::always_reply(reply));
        (
            Candidate::new(backend, "m", client.clone() as Arc<dyn LlmClient>),
            client,
        )
    }

    #[tokio::test]
    async fn rotates_past_transient_failures_and_remembers_offset() {
        // 前两个候选始终限流，第三个健康：应恰好尝试 3 次并把游标停在 2
        let (ok, ok_client) = healthy("c", "hello");
        let chain = FailoverChain::new(vec![failing("a"), failing("b"), ok]);

        let reply = chain.complete(&[Message::user("hi")]).await.unwrap();
        assert_eq!(reply, "hello");
        assert_eq!(chain.cursor(), 2);
        assert_eq!(ok_client.call_count(), 1);

        // 第二次调用直接从游标起步，不再撞前两个候选
        let _ = chain.complete(&[Message::user("again")]).await.unwrap();
        assert_eq!(ok_client.call_count(), 2);
        assert_eq!(chain.cursor(), 2);
    }

    #[tokio::test]
    async fn candidate_recovers_after_exhaustion() {
        // 第一次限流、第二次恢复的候选：耗尽之后链条要能再用上它
        let flaky = Arc::new(MockLlmClient::scripted(vec![
            Err(LlmError::RateLimited("429".to_string())),
            Ok("recovered".to_string()),
        ]));
        let chain = FailoverChain::new(vec![
            Candidate::new("a", "m", flaky.clone() as Arc<dyn LlmClient>),
            failing("b"),
        ]);

        let err = chain.complete(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::Exhausted { .. }));

        let reply = chain.complete(&[Message::user("hi")]).await.unwrap();
        assert_eq!(reply, "recovered");
        assert_eq!(chain.cursor(), 0);
        assert_eq!(flaky.call_count(), 2);
    }

    struct StalledClient;

    #[async_trait::async_trait]
    impl LlmClient for StalledClient {
        async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("too late".to_string())
        }
    }

    #[tokio::test]
    async fn stalled_candidate_times_out_and_rotates() {
        let (ok, ok_client) = healthy("b", "hello");
        let chain = FailoverChain::new(vec![
            Candidate::new("a", "m", Arc::new(StalledClient)),
            ok,
        ])
        .with_timeout(Duration::from_millis(20));

        let reply = chain.complete(&[Message::user("hi")]).await.unwrap();
        assert_eq!(reply, "hello");
        assert_eq!(chain.cursor(), 1);
        assert_eq!(ok_client.call_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_after_all_candidates_fail() {
        let chain = FailoverChain::new(vec![failing("a"), failing("b")]);
        let err = chain.complete(&[Message::user("hi")]).await.unwrap_err();
        match err {
            LlmError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(last.contains("429"));
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_transient_error_aborts_immediately() {
        let bad = Candidate::new(
            "a",
            "m",
            Arc::new(MockLlmClient::always_fail(LlmError::Api(
                "invalid api key".to_string(),
            ))),
        );
        let (ok, ok_client) = healthy("b", "hello");
        let chain = FailoverChain::new(vec![bad, ok]);

        let err = chain.complete(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::Api(_)));
        // 不可转移错误不轮转
        assert_eq!(ok_client.call_count(), 0);
    }

    #[derive(Debug, Deserialize, schemars::JsonSchema)]
    struct Pair {
        a: u32,
        b: String,
    }

    #[tokio::test]
    async fn structured_parse_tolerates_wrapped_json() {
        let client = Arc::new(MockLlmClient::always_reply(
            "Sure, here is the result:\n```json\n{\"a\": 1, \"b\": \"x\"}\n```\nDone.",
        ));
        let chain = FailoverChain::new(vec![Candidate::new("a", "m", client)]);
        let pair: Pair = chain
            .complete_structured(&[Message::user("go")])
            .await
            .unwrap();
        assert_eq!(pair.a, 1);
        assert_eq!(pair.b, "x");
    }

    #[test]
    fn extract_json_picks_largest_fragment() {
        let text = "noise {\"a\":1} and [1,2,3,4,5,6,7]";
        assert_eq!(extract_json(text), Some("[1,2,3,4,5,6,7]"));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn parse_structured_reports_parse_error() {
        let err = parse_structured::<Pair>("{\"a\": \"not a number\"}").unwrap_err();
        assert!(matches!(err, LlmError::Parse(_)));
    }
}
