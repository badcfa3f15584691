//! Command executor - runs dispatched commands and reports their outcome

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use switchyard_shared::{
    CommandAck, CommandComplete, CommandRequest, Envelope, Heartbeat, MessageType, OutputStream,
    TerminalOutput, TokenRefresh,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Environment variable carrying the latest hub-issued token to children
pub const TOKEN_ENV: &str = "SWITCHYARD_TOKEN";

struct Running {
    cancel: CancellationToken,
    stop_reason: Option<String>,
}

/// Executes commands received from the hub
pub struct CommandExecutor {
    shell: String,
    outbound: mpsc::Sender<Envelope>,
    running: Mutex<HashMap<String, Running>>,
    status: watch::Sender<Heartbeat>,
    token: RwLock<Option<TokenRefresh>>,
}

impl CommandExecutor {
    pub fn new(
        shell: impl Into<String>,
        outbound: mpsc::Sender<Envelope>,
        status: watch::Sender<Heartbeat>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shell: shell.into(),
            outbound,
            running: Mutex::new(HashMap::new()),
            status,
            token: RwLock::new(None),
        })
    }

    /// Begin executing a request in the background
    ///
    /// Returns `false` if a command with the same id is already running.
    pub fn start(self: &Arc<Self>, request: CommandRequest) -> bool {
        let cancel = CancellationToken::new();
        {
            let mut running = self.running.lock();
            if running.contains_key(&request.command_id) {
                warn!(command_id = %request.command_id, "duplicate COMMAND_REQUEST ignored");
                return false;
            }
            running.insert(
                request.command_id.clone(),
                Running {
                    cancel: cancel.clone(),
                    stop_reason: None,
                },
            );
        }
        self.publish_status();

        info!(
            command_id = %request.command_id,
            priority = request.priority,
            time_limit_ms = request.time_limit_ms,
            "executing command"
        );
        let this = self.clone();
        tokio::spawn(async move { this.run(request, cancel).await });
        true
    }

    /// Stop one running command; `false` if it is not running
    pub fn stop(&self, command_id: &str, reason: &str) -> bool {
        let mut running = self.running.lock();
        let Some(entry) = running.get_mut(command_id) else {
            debug!(command_id, "stop requested for a command that is not running");
            return false;
        };
        info!(command_id, reason, "stopping command");
        entry.stop_reason.get_or_insert_with(|| reason.to_string());
        entry.cancel.cancel();
        true
    }

    /// Stop every running command
    pub fn stop_all(&self, reason: &str) -> usize {
        let ids = self.running_ids();
        ids.iter().filter(|id| self.stop(id, reason)).count()
    }

    /// Store a refreshed token; later children see it in their environment
    pub fn set_token(&self, refresh: TokenRefresh) {
        info!(expires_at = refresh.expires_at, "token refreshed");
        *self.token.write() = Some(refresh);
    }

    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn publish_status(&self) {
        self.status.send_replace(Heartbeat {
            status: None,
            running: self.running_ids(),
        });
    }

    async fn run(self: Arc<Self>, request: CommandRequest, cancel: CancellationToken) {
        let command_id = request.command_id.clone();
        self.emit(
            MessageType::CommandAck,
            &CommandAck {
                command_id: command_id.clone(),
            },
        )
        .await;

        let outcome = match request.payload.get("command").and_then(Value::as_str) {
            Some(script) => self.execute(&command_id, script, &cancel).await,
            None => CommandComplete::failed(&command_id, "payload has no command"),
        };

        self.running.lock().remove(&command_id);
        self.publish_status();

        info!(
            command_id = %command_id,
            success = outcome.success,
            exit_code = ?outcome.exit_code,
            "command finished"
        );
        self.emit(MessageType::CommandComplete, &outcome).await;
    }

    async fn execute(&self, command_id: &str, script: &str, cancel: &CancellationToken) -> CommandComplete {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(refresh) = self.token.read().as_ref() {
            command.env(TOKEN_ENV, &refresh.token);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return CommandComplete::failed(command_id, format!("spawn failed: {e}")),
        };

        let mut pumps: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(self.pump(command_id, OutputStream::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(self.pump(command_id, OutputStream::Stderr, stderr));
        }

        tokio::select! {
            status = child.wait() => {
                // Drain remaining output before reporting completion
                for pump in pumps {
                    let _ = pump.await;
                }
                match status {
                    Ok(status) if status.success() => CommandComplete::succeeded(command_id, status.code()),
                    Ok(status) => CommandComplete {
                        command_id: command_id.to_string(),
                        success: false,
                        exit_code: status.code(),
                        error: Some(format!("process exited with {status}")),
                        result: None,
                    },
                    Err(e) => CommandComplete::failed(command_id, format!("wait failed: {e}")),
                }
            }
            () = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(command_id, error = %e, "failed to kill child");
                }
                // Grandchildren may still hold the pipes open
                for pump in pumps {
                    pump.abort();
                }
                let reason = self
                    .running
                    .lock()
                    .get(command_id)
                    .and_then(|r| r.stop_reason.clone())
                    .unwrap_or_else(|| "stopped".into());
                CommandComplete::failed(command_id, reason)
            }
        }
    }

    fn pump<R>(&self, command_id: &str, stream: OutputStream, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let outbound = self.outbound.clone();
        let command_id = command_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let output = TerminalOutput {
                            command_id: command_id.clone(),
                            stream,
                            data: format!("{line}\n"),
                        };
                        let Ok(envelope) = Envelope::new(MessageType::TerminalOutput, &output) else {
                            continue;
                        };
                        if outbound.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(command_id = %command_id, ?stream, error = %e, "output read failed");
                        break;
                    }
                }
            }
        })
    }

    async fn emit<P: serde::Serialize>(&self, msg_type: MessageType, payload: &P) {
        match Envelope::new(msg_type, payload) {
            Ok(envelope) => {
                if self.outbound.send(envelope).await.is_err() {
                    warn!(?msg_type, "connection manager gone, message dropped");
                }
            }
            Err(e) => warn!(?msg_type, error = %e, "failed to encode message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn executor() -> (Arc<CommandExecutor>, mpsc::Receiver<Envelope>, watch::Receiver<Heartbeat>) {
        let (tx, rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(Heartbeat::default());
        (CommandExecutor::new("/bin/sh", tx, status_tx), rx, status_rx)
    }

    fn request(id: &str, script: &str) -> CommandRequest {
        CommandRequest {
            command_id: id.into(),
            priority: 50,
            time_limit_ms: 60_000,
            payload: json!({ "command": script }),
        }
    }

    /// Collect messages until COMMAND_COMPLETE
    async fn collect(rx: &mut mpsc::Receiver<Envelope>) -> (Vec<Envelope>, CommandComplete) {
        let mut seen = Vec::new();
        loop {
            let env = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for completion")
                .expect("channel closed");
            if env.msg_type == MessageType::CommandComplete {
                return (seen, env.decode_payload().unwrap());
            }
            seen.push(env);
        }
    }

    fn output_of(messages: &[Envelope]) -> String {
        messages
            .iter()
            .filter(|m| m.msg_type == MessageType::TerminalOutput)
            .map(|m| m.decode_payload::<TerminalOutput>().unwrap().data)
            .collect()
    }

    #[tokio::test]
    async fn test_streams_output_then_completes() {
        let (exec, mut rx, _status) = executor();
        assert!(exec.start(request("c1", "echo hello; echo oops >&2")));

        let (seen, complete) = collect(&mut rx).await;
        assert_eq!(seen[0].msg_type, MessageType::CommandAck);
        assert!(complete.success);
        assert_eq!(complete.exit_code, Some(0));

        let outputs: Vec<TerminalOutput> = seen
            .iter()
            .filter(|m| m.msg_type == MessageType::TerminalOutput)
            .map(|m| m.decode_payload().unwrap())
            .collect();
        assert!(outputs
            .iter()
            .any(|o| o.stream == OutputStream::Stdout && o.data == "hello\n"));
        assert!(outputs
            .iter()
            .any(|o| o.stream == OutputStream::Stderr && o.data == "oops\n"));
        assert!(exec.running_ids().is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let (exec, mut rx, _status) = executor();
        exec.start(request("c1", "exit 3"));

        let (_, complete) = collect(&mut rx).await;
        assert!(!complete.success);
        assert_eq!(complete.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_missing_command_fails() {
        let (exec, mut rx, _status) = executor();
        exec.start(CommandRequest {
            payload: json!({ "script": "echo" }),
            ..request("c1", "")
        });

        let (_, complete) = collect(&mut rx).await;
        assert!(!complete.success);
        assert_eq!(complete.error.as_deref(), Some("payload has no command"));
    }

    #[tokio::test]
    async fn test_stop_kills_child_with_reason() {
        let (exec, mut rx, mut status) = executor();
        exec.start(request("c1", "exec sleep 30"));
        assert_eq!(status.borrow_and_update().running, vec!["c1".to_string()]);

        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.msg_type, MessageType::CommandAck);
        assert!(exec.stop("c1", "cancelled by user"));

        let (_, complete) = collect(&mut rx).await;
        assert!(!complete.success);
        assert_eq!(complete.error.as_deref(), Some("cancelled by user"));
        assert!(status.borrow().running.is_empty());
        assert!(!exec.stop("c1", "again"));
    }

    #[tokio::test]
    async fn test_duplicate_request_ignored() {
        let (exec, mut rx, _status) = executor();
        assert!(exec.start(request("c1", "exec sleep 30")));
        assert!(!exec.start(request("c1", "echo twice")));
        assert_eq!(exec.stop_all("shutdown"), 1);
        let (_, complete) = collect(&mut rx).await;
        assert_eq!(complete.error.as_deref(), Some("shutdown"));
    }

    #[tokio::test]
    async fn test_refreshed_token_reaches_children() {
        let (exec, mut rx, _status) = executor();
        exec.set_token(TokenRefresh {
            token: "tok-2".into(),
            expires_at: 1,
        });
        exec.start(request("c1", "echo $SWITCHYARD_TOKEN"));

        let (seen, complete) = collect(&mut rx).await;
        assert!(complete.success);
        assert_eq!(output_of(&seen), "tok-2\n");
    }
}
