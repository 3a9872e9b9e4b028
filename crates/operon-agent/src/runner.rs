//! Spawns agent subprocesses and manages their lifecycle.
//!
//! [`AgentRunner`] launches the agent CLI in non-interactive streaming
//! mode, delivers the prompt over stdin, demultiplexes stdout into
//! [`StreamChunk`]s, and tracks every live process in an active-run
//! registry so runs can be killed by id. [`MockAgentSpawner`] replays
//! scripted chunk sequences for tests.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use operon_core::{OperonError, ProcessConfig, Result, RunId, StreamChunk};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::stream::StreamDemux;
use crate::types::{RunStats, SpawnSpec};

/// Builds the argument vector for one agent invocation.
///
/// The prompt itself is never an argument; it goes over stdin. Skills
/// ride along in the appended system prompt so the agent sees them
/// without a dedicated flag.
pub fn build_agent_args(spec: &SpawnSpec) -> Vec<String> {
    let mut args = vec![
        "--print".to_string(),
        "--verbose".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
    ];
    if let Some(model) = &spec.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(mode) = &spec.permission_mode {
        args.push("--permission-mode".to_string());
        args.push(mode.to_string());
    }
    if let Some(turns) = spec.max_turns {
        args.push("--max-turns".to_string());
        args.push(turns.to_string());
    }
    if let Some(prompt) = &spec.system_prompt {
        args.push("--system-prompt".to_string());
        args.push(prompt.clone());
    }
    if let Some(appended) = compose_append_prompt(spec) {
        args.push("--append-system-prompt".to_string());
        args.push(appended);
    }
    args
}

fn compose_append_prompt(spec: &SpawnSpec) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(appended) = &spec.append_system_prompt {
        parts.push(appended.clone());
    }
    if !spec.skills.is_empty() {
        parts.push(format!("Active skill packs: {}.", spec.skills.join(", ")));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Live view of one spawned run handed back to the caller.
///
/// Chunks arrive in stream order and the channel closes once the
/// process has exited and its stats are finalized. A `Done` chunk is
/// always delivered, synthesized from the exit status when the process
/// dies without emitting a result event.
pub struct RunHandle {
    pub run_id: RunId,
    pub pid: Option<u32>,
    pub chunks: mpsc::UnboundedReceiver<StreamChunk>,
}

/// Seam between the engine and real subprocesses.
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    /// Launches an agent run under the given id.
    async fn spawn(&self, run_id: &str, spec: SpawnSpec) -> Result<RunHandle>;

    /// Terminates a run gracefully, then forcefully after the grace
    /// window. Returns `false` when the id is unknown, which covers
    /// both never-spawned and already-finished runs.
    async fn kill(&self, run_id: &str) -> bool;

    /// Ids of runs whose processes have not finished yet.
    async fn active_runs(&self) -> Vec<RunId>;
}

struct ActiveRun {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Runs the real agent binary.
pub struct AgentRunner {
    binary: String,
    kill_grace: Duration,
    active: Arc<Mutex<HashMap<RunId, ActiveRun>>>,
}

impl AgentRunner {
    pub fn new(binary: impl Into<String>, kill_grace: Duration) -> Self {
        Self {
            binary: binary.into(),
            kill_grace,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &ProcessConfig) -> Self {
        Self::new(
            config.agent_binary.clone(),
            Duration::from_millis(config.kill_grace_ms),
        )
    }

    /// Reads the process until EOF, forwarding chunks and accumulating
    /// stats, then finalizes the run and drops it from the registry.
    async fn pump(
        run_id: RunId,
        mut child: Child,
        prompt: String,
        mut kill_rx: oneshot::Receiver<()>,
        kill_grace: Duration,
        tx: mpsc::UnboundedSender<StreamChunk>,
        active: Arc<Mutex<HashMap<RunId, ActiveRun>>>,
    ) {
        // The process may exit before reading the prompt; a broken pipe
        // here is not a run failure.
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(prompt.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let mut demux = StreamDemux::new();
        let mut stats = RunStats::default();
        let mut saw_done = false;

        if let Some(mut stdout) = child.stdout.take() {
            let mut buf = [0u8; 8192];
            let mut kill_requested = false;
            loop {
                tokio::select! {
                    read = stdout.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => {
                            for chunk in demux.push(&buf[..n]) {
                                track(&mut stats, &mut saw_done, &chunk);
                                let _ = tx.send(chunk);
                            }
                        }
                        Err(err) => {
                            debug!(run_id = %run_id, error = %err, "Agent stdout read failed");
                            break;
                        }
                    },
                    _ = &mut kill_rx, if !kill_requested => {
                        kill_requested = true;
                        terminate(&mut child, kill_grace).await;
                    }
                }
            }
        }
        for chunk in demux.finish() {
            track(&mut stats, &mut saw_done, &chunk);
            let _ = tx.send(chunk);
        }

        let exit_code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "Failed to reap agent process");
                -1
            }
        };
        if !saw_done {
            stats.exit_code = Some(exit_code);
            let _ = tx.send(StreamChunk::Done { exit_code });
        }

        if active.lock().await.remove(&run_id).is_some() {
            info!(
                run_id = %run_id,
                exit_code = stats.exit_code.unwrap_or(exit_code),
                cost_usd = stats.cost_usd,
                input_tokens = stats.input_tokens,
                output_tokens = stats.output_tokens,
                events = stats.event_count,
                "Agent run finished"
            );
        }
    }
}

fn track(stats: &mut RunStats, saw_done: &mut bool, chunk: &StreamChunk) {
    stats.event_count += 1;
    match chunk {
        StreamChunk::CostUpdate {
            input_tokens,
            output_tokens,
            cost_usd,
        } => {
            stats.input_tokens += input_tokens;
            stats.output_tokens += output_tokens;
            stats.cost_usd += cost_usd;
        }
        StreamChunk::Done { exit_code } => {
            *saw_done = true;
            stats.exit_code = Some(*exit_code);
        }
        _ => {}
    }
}

/// SIGTERM first, SIGKILL once the grace window runs out.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        debug!(pid, "Sending SIGTERM to agent process");
        let _ = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .await;
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "Agent ignored SIGTERM; killing");
    }
    let _ = child.start_kill();
}

#[async_trait]
impl AgentSpawner for AgentRunner {
    #[instrument(skip(self, spec), fields(cwd = %spec.cwd.display()))]
    async fn spawn(&self, run_id: &str, spec: SpawnSpec) -> Result<RunHandle> {
        let args = build_agent_args(&spec);
        debug!(binary = %self.binary, ?args, "Spawning agent");

        let child = Command::new(&self.binary)
            .args(&args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                OperonError::AgentSpawn(format!(
                    "Failed to spawn '{}' in {}: {}",
                    self.binary,
                    spec.cwd.display(),
                    err
                ))
            })?;
        let pid = child.id();

        let (tx, rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        self.active.lock().await.insert(
            run_id.to_string(),
            ActiveRun {
                pid,
                kill_tx: Some(kill_tx),
            },
        );

        tokio::spawn(Self::pump(
            run_id.to_string(),
            child,
            spec.prompt,
            kill_rx,
            self.kill_grace,
            tx,
            Arc::clone(&self.active),
        ));

        Ok(RunHandle {
            run_id: run_id.to_string(),
            pid,
            chunks: rx,
        })
    }

    async fn kill(&self, run_id: &str) -> bool {
        let mut active = self.active.lock().await;
        match active.get_mut(run_id) {
            Some(run) => {
                if let Some(kill_tx) = run.kill_tx.take() {
                    debug!(run_id, pid = ?run.pid, "Kill requested");
                    let _ = kill_tx.send(());
                }
                true
            }
            None => {
                debug!(run_id, "Kill requested for unknown run");
                false
            }
        }
    }

    async fn active_runs(&self) -> Vec<RunId> {
        self.active.lock().await.keys().cloned().collect()
    }
}

/// Replays scripted chunk sequences instead of spawning processes.
///
/// Scripts are consumed in spawn order. A script ending in a `Done`
/// chunk completes immediately; one without stays registered as active
/// until killed, which closes the stream with a non-zero `Done`.
#[derive(Clone, Default)]
pub struct MockAgentSpawner {
    scripts: Arc<Mutex<VecDeque<Vec<StreamChunk>>>>,
    spawned: Arc<Mutex<Vec<(RunId, SpawnSpec)>>>,
    active: Arc<Mutex<HashMap<RunId, mpsc::UnboundedSender<StreamChunk>>>>,
    killed: Arc<Mutex<Vec<RunId>>>,
}

impl MockAgentSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_script(self, chunks: Vec<StreamChunk>) -> Self {
        self.scripts.lock().await.push_back(chunks);
        self
    }

    /// Specs recorded for every spawn, in order.
    pub async fn spawned(&self) -> Vec<(RunId, SpawnSpec)> {
        self.spawned.lock().await.clone()
    }

    pub async fn killed(&self) -> Vec<RunId> {
        self.killed.lock().await.clone()
    }
}

#[async_trait]
impl AgentSpawner for MockAgentSpawner {
    async fn spawn(&self, run_id: &str, spec: SpawnSpec) -> Result<RunHandle> {
        self.spawned
            .lock()
            .await
            .push((run_id.to_string(), spec.clone()));

        let script = self
            .scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| vec![StreamChunk::Done { exit_code: 0 }]);
        let ends_done = matches!(script.last(), Some(StreamChunk::Done { .. }));

        let (tx, rx) = mpsc::unbounded_channel();
        for chunk in script {
            let _ = tx.send(chunk);
        }
        if !ends_done {
            // Keep the channel open so the run looks alive until killed.
            self.active.lock().await.insert(run_id.to_string(), tx);
        }

        Ok(RunHandle {
            run_id: run_id.to_string(),
            pid: None,
            chunks: rx,
        })
    }

    async fn kill(&self, run_id: &str) -> bool {
        self.killed.lock().await.push(run_id.to_string());
        match self.active.lock().await.remove(run_id) {
            Some(tx) => {
                let _ = tx.send(StreamChunk::Done { exit_code: 130 });
                true
            }
            None => false,
        }
    }

    async fn active_runs(&self) -> Vec<RunId> {
        self.active.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PermissionMode;

    #[test]
    fn args_include_streaming_flags_and_optionals() {
        let spec = SpawnSpec::new("prompt", "/tmp")
            .with_model("claude-sonnet-4")
            .with_permission_mode(PermissionMode::AcceptEdits)
            .with_max_turns(15);
        let args = build_agent_args(&spec);

        assert_eq!(args[0], "--print");
        assert!(args.contains(&"stream-json".to_string()));
        let model_at = args.iter().position(|a| a == "--model");
        assert_eq!(args[model_at.unwrap() + 1], "claude-sonnet-4");
        assert!(args.contains(&"acceptEdits".to_string()));
        assert!(args.contains(&"15".to_string()));
        assert!(!args.contains(&"prompt".to_string()));
    }

    #[test]
    fn skills_land_in_append_system_prompt() {
        let spec = SpawnSpec::new("p", "/tmp")
            .with_skills(vec!["frontend".to_string(), "testing".to_string()])
            .with_append_system_prompt("Be brief.");
        let args = build_agent_args(&spec);
        let at = args
            .iter()
            .position(|a| a == "--append-system-prompt")
            .unwrap();
        assert!(args[at + 1].contains("Be brief."));
        assert!(args[at + 1].contains("frontend, testing"));
    }

    #[test]
    fn bare_spec_omits_optional_flags() {
        let args = build_agent_args(&SpawnSpec::new("p", "/tmp"));
        assert!(!args.iter().any(|a| a == "--model"));
        assert!(!args.iter().any(|a| a == "--append-system-prompt"));
        assert!(!args.iter().any(|a| a == "--system-prompt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_process_lifecycle_finishes_and_clears_registry() {
        let dir = tempfile::TempDir::new().unwrap();
        // `true` ignores every argument and never reads stdin, which
        // exercises the broken-pipe and synthetic-done paths.
        let runner = AgentRunner::new("true", Duration::from_millis(200));
        let mut handle = runner
            .spawn("run-1", SpawnSpec::new("ignored", dir.path()))
            .await
            .unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = handle.chunks.recv().await {
            chunks.push(chunk);
        }
        assert!(matches!(
            chunks.last(),
            Some(StreamChunk::Done { exit_code: 0 })
        ));
        assert!(runner.active_runs().await.is_empty());
        assert!(!runner.kill("run-1").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_process_yields_nonzero_done() {
        let dir = tempfile::TempDir::new().unwrap();
        // `cat` rejects the flags and exits with an error.
        let runner = AgentRunner::new("cat", Duration::from_millis(200));
        let mut handle = runner
            .spawn("run-err", SpawnSpec::new("ignored", dir.path()))
            .await
            .unwrap();

        let mut last = None;
        while let Some(chunk) = handle.chunks.recv().await {
            last = Some(chunk);
        }
        assert!(matches!(
            last,
            Some(StreamChunk::Done { exit_code }) if exit_code != 0
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_terminates_long_running_process() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        // The runner always passes `--`-prefixed flags, which GNU `yes`
        // rejects; this stub ignores its args and blocks until signaled.
        let stub = dir.path().join("hang.sh");
        std::fs::write(&stub, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        let runner = AgentRunner::new(stub.to_str().unwrap(), Duration::from_millis(500));
        let mut handle = runner
            .spawn("run-kill", SpawnSpec::new("ignored", dir.path()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(runner.kill("run-kill").await);
        let mut last = None;
        while let Some(chunk) = handle.chunks.recv().await {
            last = Some(chunk);
        }
        assert!(matches!(
            last,
            Some(StreamChunk::Done { exit_code }) if exit_code != 0
        ));
        assert!(runner.active_runs().await.is_empty());
    }

    #[tokio::test]
    async fn spawn_for_missing_binary_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = AgentRunner::new(
            "operon-test-binary-that-does-not-exist",
            Duration::from_millis(100),
        );
        let result = runner
            .spawn("run-x", SpawnSpec::new("p", dir.path()))
            .await;
        assert!(matches!(result, Err(OperonError::AgentSpawn(_))));
        assert!(runner.active_runs().await.is_empty());
    }

    #[tokio::test]
    async fn mock_replays_script_and_records_spec() {
        let spawner = MockAgentSpawner::new()
            .with_script(vec![
                StreamChunk::AssistantText {
                    text: "working".to_string(),
                },
                StreamChunk::Done { exit_code: 0 },
            ])
            .await;

        let mut handle = spawner
            .spawn("run-a", SpawnSpec::new("build it", "/tmp/wt"))
            .await
            .unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = handle.chunks.recv().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 2);

        let spawned = spawner.spawned().await;
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].1.prompt, "build it");
        assert!(spawner.active_runs().await.is_empty());
    }

    #[tokio::test]
    async fn mock_hanging_script_stays_active_until_killed() {
        let spawner = MockAgentSpawner::new()
            .with_script(vec![StreamChunk::AssistantText {
                text: "stuck".to_string(),
            }])
            .await;

        let mut handle = spawner
            .spawn("run-h", SpawnSpec::new("p", "/tmp"))
            .await
            .unwrap();
        assert_eq!(spawner.active_runs().await, vec!["run-h".to_string()]);

        assert!(spawner.kill("run-h").await);
        let mut last = None;
        while let Some(chunk) = handle.chunks.recv().await {
            last = Some(chunk);
        }
        assert!(matches!(last, Some(StreamChunk::Done { exit_code: 130 })));
        assert!(!spawner.kill("run-h").await);
    }
}
