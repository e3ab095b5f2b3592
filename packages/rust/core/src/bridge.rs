//! Production agent backed by a bridge subprocess.
//!
//! The bridge is spawned on first use and speaks JSON lines over
//! stdin/stdout: it announces `ready`, then answers every `execute` request
//! with a `result` or an `error`. `shutdown` asks it to exit.
//!
//! A call owns its bridge for as long as it runs. A call abandoned by the
//! caller (a production timeout) keeps its bridge, and the next call spawns a
//! fresh one instead of waiting.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use repolore_shared::{AgentSection, RepoloreError, Result};

use crate::budget::Budget;
use crate::collaborators::{
    DimensionMeta, ProductionAgent, ProductionReply, ProductionRequest, ToolCall,
};

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestMessage<'a> {
    Execute {
        id: String,
        prompt: &'a str,
        budget: &'a Budget,
        dimension: &'a DimensionMeta,
        conversation_id: &'a str,
        model: &'a str,
    },
    Shutdown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseMessage {
    Ready,
    Result {
        id: String,
        reply: String,
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
    },
    Error {
        id: String,
        error: String,
    },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// How long a bridge may take to exit after `shutdown` before it is killed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How to launch the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Whether the bridge counts as a real production agent.
    pub enabled: bool,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: String,
    /// Model identifier forwarded with every request.
    pub model: String,
    pub shutdown_grace: Duration,
}

impl From<&AgentSection> for BridgeConfig {
    fn from(section: &AgentSection) -> Self {
        Self {
            enabled: section.enabled,
            command: section.command.clone(),
            args: vec!["run".into(), section.script.clone()],
            working_dir: section.working_dir.clone(),
            model: section.model.clone(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

struct BridgeHandle {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    request_counter: u64,
}

fn bridge_err(msg: impl Into<String>) -> RepoloreError {
    RepoloreError::Production(msg.into())
}

impl BridgeHandle {
    async fn spawn(config: &BridgeConfig) -> Result<Self> {
        info!(cmd = %config.command, args = ?config.args, "spawning agent bridge");

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .current_dir(&config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                bridge_err(format!(
                    "failed to spawn bridge: {e}. Is `{}` installed?",
                    config.command
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| bridge_err("failed to capture bridge stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| bridge_err("failed to capture bridge stdout"))?;

        let mut handle = Self {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            request_counter: 0,
        };
        handle.wait_for_ready().await?;
        Ok(handle)
    }

    async fn read_message(&mut self) -> Result<ResponseMessage> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| bridge_err(format!("bridge read error: {e}")))?
                .ok_or_else(|| bridge_err("bridge closed stdout unexpectedly"))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return serde_json::from_str(line).map_err(|e| {
                bridge_err(format!(
                    "invalid bridge message: {e} (got: {})",
                    line.chars().take(200).collect::<String>()
                ))
            });
        }
    }

    async fn wait_for_ready(&mut self) -> Result<()> {
        match self.read_message().await? {
            ResponseMessage::Ready => {
                info!("bridge is ready");
                Ok(())
            }
            other => Err(bridge_err(format!("expected ready message, got: {other:?}"))),
        }
    }

    async fn write_message(&mut self, msg: &RequestMessage<'_>) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.stdin
            .write_all(format!("{json}\n").as_bytes())
            .await
            .map_err(|e| bridge_err(format!("failed to write to bridge stdin: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| bridge_err(format!("failed to flush bridge stdin: {e}")))
    }

    /// Send one request. The outer error is a protocol failure, the inner
    /// one an error reported by the bridge itself.
    async fn execute(
        &mut self,
        prompt: &str,
        request: &ProductionRequest,
        model: &str,
    ) -> Result<std::result::Result<ProductionReply, String>> {
        self.request_counter += 1;
        let id = format!("req-{}", self.request_counter);

        self.write_message(&RequestMessage::Execute {
            id: id.clone(),
            prompt,
            budget: &request.budget,
            dimension: &request.dimension,
            conversation_id: &request.conversation_id,
            model,
        })
        .await?;

        match self.read_message().await? {
            ResponseMessage::Result {
                id: resp_id,
                reply,
                tool_calls,
            } if resp_id == id => Ok(Ok(ProductionReply { reply, tool_calls })),
            ResponseMessage::Error { id: resp_id, error } if resp_id == id => Ok(Err(error)),
            other => Err(bridge_err(format!(
                "unexpected bridge message for {id}: {other:?}"
            ))),
        }
    }

    /// Ask the bridge to exit, killing it if it is still running after `grace`.
    async fn shutdown(mut self, grace: Duration) {
        if let Err(e) = self.write_message(&RequestMessage::Shutdown).await {
            debug!(error = %e, "bridge already gone");
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!(?status, "bridge exited"),
            Ok(Err(e)) => warn!("bridge wait error: {e}"),
            Err(_) => {
                warn!(grace_secs = grace.as_secs_f64(), "bridge did not exit in time, killing it");
                if let Err(e) = self.child.kill().await {
                    warn!("failed to kill bridge: {e}");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// [`ProductionAgent`] that forwards every call to a bridge subprocess.
///
/// One idle bridge is kept between calls. A call checks it out (or spawns a
/// new one) and returns it when done, so the slot lock is never held across a
/// request.
pub struct BridgeAgent {
    config: BridgeConfig,
    idle: Mutex<Option<BridgeHandle>>,
    closed: AtomicBool,
}

impl BridgeAgent {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Stop the idle bridge if there is one. Bridges still held by running
    /// calls are stopped when those calls return.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let idle = self.idle.lock().await.take();
        if let Some(handle) = idle {
            handle.shutdown(self.config.shutdown_grace).await;
        }
    }

    async fn checkout(&self) -> Result<BridgeHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(bridge_err("bridge agent is shut down"));
        }
        let idle = self.idle.lock().await.take();
        match idle {
            Some(handle) => Ok(handle),
            None => BridgeHandle::spawn(&self.config).await,
        }
    }

    async fn checkin(&self, handle: BridgeHandle) {
        let surplus = {
            let mut idle = self.idle.lock().await;
            if self.closed.load(Ordering::SeqCst) || idle.is_some() {
                Some(handle)
            } else {
                *idle = Some(handle);
                None
            }
        };
        if let Some(handle) = surplus {
            debug!("retiring surplus bridge");
            handle.shutdown(self.config.shutdown_grace).await;
        }
    }
}

#[async_trait]
impl ProductionAgent for BridgeAgent {
    fn has_real_capability(&self) -> bool {
        self.config.enabled
    }

    #[instrument(skip_all, fields(dimension = %request.dimension.id))]
    async fn execute(&self, prompt: &str, request: &ProductionRequest) -> Result<ProductionReply> {
        let mut handle = self.checkout().await?;

        match handle.execute(prompt, request, &self.config.model).await {
            Ok(outcome) => {
                self.checkin(handle).await;
                outcome.map_err(bridge_err)
            }
            Err(e) => {
                warn!(error = %e, "dropping bridge after protocol failure");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::compute_budget;
    use repolore_shared::OutputKind;

    fn request() -> ProductionRequest {
        ProductionRequest {
            budget: compute_budget(OutputKind::Candidates, 3),
            dimension: DimensionMeta {
                id: "code-standard".into(),
                label: "Code standards".into(),
                output: OutputKind::Candidates,
                knowledge_types: vec![],
            },
            conversation_id: "s:code-standard".into(),
        }
    }

    #[test]
    fn execute_message_serializes() {
        let req = request();
        let msg = RequestMessage::Execute {
            id: "req-1".into(),
            prompt: "analyse",
            budget: &req.budget,
            dimension: &req.dimension,
            conversation_id: &req.conversation_id,
            model: "m",
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "execute");
        assert_eq!(json["id"], "req-1");
        assert_eq!(json["budget"]["maxSubmits"], 6);
        assert_eq!(json["dimension"]["id"], "code-standard");
        assert_eq!(json["conversation_id"], "s:code-standard");
    }

    #[test]
    fn shutdown_message_serializes() {
        let json = serde_json::to_string(&RequestMessage::Shutdown).unwrap();
        assert_eq!(json, r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn result_message_deserializes() {
        let json = r#"{"type":"result","id":"req-1","reply":"done","tool_calls":[{"name":"submit_knowledge","args":{"title":"t"},"status":"accepted"}]}"#;
        match serde_json::from_str::<ResponseMessage>(json).unwrap() {
            ResponseMessage::Result { id, reply, tool_calls } => {
                assert_eq!(id, "req-1");
                assert_eq!(reply, "done");
                assert_eq!(tool_calls.len(), 1);
                assert!(tool_calls[0].accepted_submission().is_some());
            }
            other => panic!("expected Result, got {other:?}"),
        }
    }

    #[test]
    fn error_message_deserializes() {
        let json = r#"{"type":"error","id":"req-2","error":"rate limited"}"#;
        match serde_json::from_str::<ResponseMessage>(json).unwrap() {
            ResponseMessage::Error { id, error } => {
                assert_eq!(id, "req-2");
                assert_eq!(error, "rate limited");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn config_from_agent_section() {
        let section = AgentSection::default();
        let config = BridgeConfig::from(&section);
        assert!(!config.enabled);
        assert_eq!(config.command, "bun");
        assert_eq!(config.args[0], "run");
        assert!(!BridgeAgent::new(config).has_real_capability());
    }

    #[cfg(unix)]
    fn scripted_bridge(script: &str) -> BridgeAgent {
        BridgeAgent::new(BridgeConfig {
            enabled: true,
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            working_dir: ".".into(),
            model: "test-model".into(),
            shutdown_grace: Duration::from_millis(300),
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn round_trip_through_subprocess() {
        let agent = scripted_bridge(
            r#"echo '{"type":"ready"}'; read req; echo '{"type":"result","id":"req-1","reply":"all good","tool_calls":[]}'; read bye"#,
        );
        let reply = agent.execute("prompt", &request()).await.expect("reply");
        assert_eq!(reply.reply, "all good");
        assert!(reply.tool_calls.is_empty());
        agent.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bridge_error_is_production_error() {
        let agent = scripted_bridge(
            r#"echo '{"type":"ready"}'; read req; echo '{"type":"error","id":"req-1","error":"rate limited"}'; read bye"#,
        );
        let err = agent.execute("prompt", &request()).await.unwrap_err();
        assert_eq!(err.to_string(), "production error: rate limited");
        agent.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_ready_is_an_error() {
        let agent = scripted_bridge("exit 0");
        let err = agent.execute("prompt", &request()).await.unwrap_err();
        assert!(err.to_string().contains("closed stdout"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn abandoned_call_does_not_block_the_next_one() {
        let agent = std::sync::Arc::new(scripted_bridge(
            r#"echo '{"type":"ready"}'; read req; case "$req" in *'"prompt":"slow"'*) exec sleep 30;; esac; echo '{"type":"result","id":"req-1","reply":"done","tool_calls":[]}'; read bye"#,
        ));

        let slow = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.execute("slow", &request()).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let reply = tokio::time::timeout(Duration::from_secs(10), agent.execute("fast", &request()))
            .await
            .expect("second call waited on the abandoned one")
            .expect("reply");
        assert_eq!(reply.reply, "done");

        tokio::time::timeout(Duration::from_secs(10), agent.shutdown())
            .await
            .expect("shutdown finished");
        slow.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_kills_bridge_that_ignores_it() {
        let agent = scripted_bridge(
            r#"echo '{"type":"ready"}'; read req; echo '{"type":"result","id":"req-1","reply":"ok","tool_calls":[]}'; exec sleep 30"#,
        );
        agent.execute("prompt", &request()).await.expect("reply");

        tokio::time::timeout(Duration::from_secs(5), agent.shutdown())
            .await
            .expect("shutdown is bounded");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn calls_after_shutdown_are_refused() {
        let agent = scripted_bridge("exit 0");
        agent.shutdown().await;
        let err = agent.execute("prompt", &request()).await.unwrap_err();
        assert!(err.to_string().contains("shut down"));
    }
}
