//! Persistent interactive terminal sessions.
//!
//! Each session owns a dedicated connection and a PTY shell. Commands are
//! followed by a sentinel echo whose printed form differs from its echoed
//! input, so completion is detected without guessing at prompts.
//!
//! # Lifecycle
//!
//! created -> active (first command) -> closed. A closed id is gone from
//! the table and can only come back through a new `create`.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::mcp::endpoint::Endpoint;
use crate::mcp::error::{HardwareError, Result};
use crate::mcp::security::SecurityValidator;
use crate::mcp::transport::{
    ConnectMode, Connector, MAX_SHELL_BUFFER, RemoteConnection, ShellChannel, append_bounded,
};
use crate::mcp::types::{TerminalOutput, TerminalSessionInfo};

/// Maximum commands kept in a session's history
pub(crate) const MAX_HISTORY: usize = 100;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SENTINEL_PREFIX: &str = "__HWMCP_DONE_";
const PROMPT_SUFFIXES: &[&str] = &["$ ", "# "];

/// How the end of a command's output is recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Wait for the printed sentinel
    #[default]
    Sentinel,
    /// Also accept a trailing shell prompt
    Prompt,
}

impl FromStr for CompletionMode {
    type Err = HardwareError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sentinel" => Ok(CompletionMode::Sentinel),
            "prompt" => Ok(CompletionMode::Prompt),
            other => Err(HardwareError::Configuration(format!(
                "Unknown terminal completion mode: {}",
                other
            ))),
        }
    }
}

/// Bounded FIFO of executed commands.
#[derive(Debug, Default)]
pub struct CommandHistory {
    entries: VecDeque<String>,
}

impl CommandHistory {
    pub fn push(&mut self, command: impl Into<String>) {
        self.entries.push_back(command.into());
        while self.entries.len() > MAX_HISTORY {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }
}

pub struct TerminalSession {
    id: String,
    endpoint_key: String,
    conn: Box<dyn RemoteConnection>,
    shell: Box<dyn ShellChannel>,
    created: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    history: CommandHistory,
    max_idle: Duration,
}

impl TerminalSession {
    /// True when the session has been idle for longer than its limit.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_activity)
            .to_std()
            .map(|idle| idle > self.max_idle)
            .unwrap_or(false)
    }

    fn info(&self) -> TerminalSessionInfo {
        TerminalSessionInfo {
            session_id: self.id.clone(),
            endpoint: self.endpoint_key.clone(),
            created_at: self.created.to_rfc3339(),
            last_activity: self.last_activity.to_rfc3339(),
            history_len: self.history.len(),
            interactive: true,
        }
    }

    async fn shutdown(&self) {
        self.shell.close().await;
        self.conn.close().await;
    }
}

pub struct TerminalManager {
    connector: Arc<dyn Connector>,
    validator: Arc<SecurityValidator>,
    sessions: DashMap<String, Arc<Mutex<TerminalSession>>>,
    max_idle: Duration,
    completion: CompletionMode,
}

impl TerminalManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        validator: Arc<SecurityValidator>,
        max_idle: Duration,
        completion: CompletionMode,
    ) -> Self {
        Self {
            connector,
            validator,
            sessions: DashMap::new(),
            max_idle,
            completion,
        }
    }

    /// Open a session on `endpoint`. A generated id is 8 characters.
    pub async fn create(&self, endpoint: &Endpoint, session_id: Option<String>) -> Result<String> {
        let id = session_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..8].to_string());
        if self.sessions.contains_key(&id) {
            return Err(HardwareError::SessionExists(id));
        }

        let conn = self
            .connector
            .connect(endpoint, ConnectMode::Session)
            .await?;
        let shell = match conn.open_shell().await {
            Ok(shell) => shell,
            Err(e) => {
                conn.close().await;
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let session = TerminalSession {
            id: id.clone(),
            endpoint_key: endpoint.key(),
            conn,
            shell,
            created: now,
            last_activity: now,
            history: CommandHistory::default(),
            max_idle: self.max_idle,
        };

        // Another create may have claimed the id while we were connecting
        let session = Arc::new(Mutex::new(session));
        let inserted = match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                true
            }
        };
        if !inserted {
            session.lock().await.shutdown().await;
            return Err(HardwareError::SessionExists(id));
        }

        info!("Created terminal session {} on {}", id, endpoint.key());
        Ok(id)
    }

    /// Run `command` in a session and collect its output.
    ///
    /// Commands on the same session are serialized.
    pub async fn execute_in(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<TerminalOutput> {
        let session = self.session(session_id)?;
        let mut session = session.lock().await;

        // Discard anything printed since the last command (banners, prompts)
        let _ = session.shell.drain().await;

        let nonce = Uuid::new_v4().simple().to_string();
        let marker = format!("{}{}__", SENTINEL_PREFIX, nonce);
        let input = format!(
            "{}\necho {}\"{}\"__\n",
            command, SENTINEL_PREFIX, nonce
        );
        session.shell.write(input.as_bytes()).await?;

        let deadline = Instant::now() + timeout;
        let mut received = Vec::new();
        let mut raw = String::new();
        let completed = loop {
            let chunk = session.shell.drain().await;
            if !chunk.is_empty() {
                append_bounded(&mut received, &chunk, MAX_SHELL_BUFFER);
                raw = String::from_utf8_lossy(&received).into_owned();
            }

            if contains_marker(&raw, &marker) {
                break true;
            }
            if self.completion == CompletionMode::Prompt && ends_with_prompt(&raw) {
                break true;
            }
            if session.shell.is_closed() {
                warn!("Shell for session {} closed during command", session_id);
                break false;
            }
            if Instant::now() >= deadline {
                debug!("Session {} command timed out after {:?}", session_id, timeout);
                break false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        session.history.push(command);
        session.last_activity = Utc::now();

        let output = clean_output(&raw, command, &marker, &nonce);
        Ok(TerminalOutput {
            session_id: session_id.to_string(),
            command: command.to_string(),
            output: self.validator.sanitize_command_output(&output),
            completed,
            timestamp: Utc::now().to_rfc3339(),
        })
    }

    /// Close a session. Returns false when the id is unknown.
    pub async fn close(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };
        session.lock().await.shutdown().await;
        info!("Closed terminal session {}", session_id);
        true
    }

    pub async fn list(&self) -> Vec<TerminalSessionInfo> {
        let sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.lock().await.info());
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<String>> {
        let session = self.session(session_id)?;
        let history = session.lock().await.history.to_vec();
        Ok(history)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every session idle for longer than the limit.
    ///
    /// Sessions busy with a command are skipped. Returns the number closed.
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now()).await
    }

    pub(crate) async fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let candidates: Vec<_> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut expired = Vec::new();
        for (id, session) in candidates {
            if let Ok(guard) = session.try_lock()
                && guard.is_expired_at(now)
            {
                expired.push(id);
            }
        }

        let mut closed = 0;
        for id in expired {
            if self.close(&id).await {
                info!("Closed idle terminal session {}", id);
                closed += 1;
            }
        }
        closed
    }

    /// Close all sessions.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    fn session(&self, session_id: &str) -> Result<Arc<Mutex<TerminalSession>>> {
        self.sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| HardwareError::SessionNotFound(session_id.to_string()))
    }
}

/// The printed marker appears on a line of its own, unlike the echoed
/// input which still carries the quotes.
fn contains_marker(raw: &str, marker: &str) -> bool {
    raw.lines().any(|line| line.trim() == marker)
}

fn ends_with_prompt(raw: &str) -> bool {
    PROMPT_SUFFIXES.iter().any(|p| raw.ends_with(p))
}

/// Strip the echoed input, sentinel lines and trailing prompt.
fn clean_output(raw: &str, command: &str, marker: &str, nonce: &str) -> String {
    let mut lines: Vec<&str> = raw
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.contains(nonce) && line.trim() != marker)
        .collect();

    if let Some(pos) = lines.iter().position(|line| line.trim_end().ends_with(command.trim())) {
        lines.drain(..=pos);
    }
    while let Some(last) = lines.last() {
        let trimmed = last.trim_end();
        if trimmed.is_empty() || trimmed == "$" || trimmed == "#" {
            lines.pop();
        } else {
            break;
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::{MockConnector, endpoint};

    fn manager(connector: Arc<MockConnector>, completion: CompletionMode) -> TerminalManager {
        TerminalManager::new(
            connector,
            Arc::new(SecurityValidator::new(false)),
            Duration::from_secs(3600),
            completion,
        )
    }

    mod history {
        use super::*;

        #[test]
        fn test_bounded_fifo() {
            let mut history = CommandHistory::default();
            for i in 0..150 {
                history.push(format!("cmd {}", i));
            }
            assert_eq!(history.len(), MAX_HISTORY);
            let entries = history.to_vec();
            assert_eq!(entries[0], "cmd 50");
            assert_eq!(entries[99], "cmd 149");
        }
    }

    mod output {
        use super::*;

        #[test]
        fn test_marker_must_be_whole_line() {
            let marker = "__HWMCP_DONE_abc__";
            assert!(!contains_marker("echo __HWMCP_DONE_\"abc\"__\r\n", marker));
            assert!(contains_marker("out\r\n__HWMCP_DONE_abc__\r\n$ ", marker));
        }

        #[test]
        fn test_clean_output_strips_echo_and_sentinel() {
            let raw = "ls /opt\r\nbin  lib\r\n$ echo __HWMCP_DONE_\"abc\"__\r\n__HWMCP_DONE_abc__\r\n$ ";
            let cleaned = clean_output(raw, "ls /opt", "__HWMCP_DONE_abc__", "abc");
            assert_eq!(cleaned, "bin  lib");
        }

        #[test]
        fn test_prompt_detection() {
            assert!(ends_with_prompt("user@host:~$ "));
            assert!(ends_with_prompt("root@host:~# "));
            assert!(!ends_with_prompt("still running..."));
        }
    }

    mod sessions {
        use super::*;

        #[tokio::test]
        async fn test_create_generates_short_id() {
            let connector = Arc::new(MockConnector::new());
            let terminals = manager(connector, CompletionMode::Sentinel);

            let id = terminals.create(&endpoint("gpu-1.example.com"), None).await.unwrap();
            assert_eq!(id.len(), 8);
            assert_eq!(terminals.len(), 1);
        }

        #[tokio::test]
        async fn test_duplicate_id_rejected() {
            let connector = Arc::new(MockConnector::new());
            let terminals = manager(connector.clone(), CompletionMode::Sentinel);
            let ep = endpoint("gpu-1.example.com");

            terminals.create(&ep, Some("work".into())).await.unwrap();
            let err = terminals.create(&ep, Some("work".into())).await.unwrap_err();
            assert!(matches!(err, HardwareError::SessionExists(id) if id == "work"));
            assert_eq!(connector.connect_count(), 1);
        }

        #[tokio::test]
        async fn test_execute_collects_output() {
            let connector = Arc::new(MockConnector::new());
            connector.script_shell("nvidia-smi -L", "GPU 0: A100\nGPU 1: A100");
            let terminals = manager(connector, CompletionMode::Sentinel);

            let id = terminals.create(&endpoint("gpu-1.example.com"), None).await.unwrap();
            let out = terminals
                .execute_in(&id, "nvidia-smi -L", Duration::from_secs(5))
                .await
                .unwrap();
            assert!(out.completed);
            assert_eq!(out.output, "GPU 0: A100\nGPU 1: A100");
            assert_eq!(terminals.history(&id).await.unwrap(), vec!["nvidia-smi -L"]);
        }

        #[tokio::test]
        async fn test_execute_sanitizes_output() {
            let connector = Arc::new(MockConnector::new());
            connector.script_shell("cat .env", "TOKEN=abcdef");
            let terminals = manager(connector, CompletionMode::Sentinel);

            let id = terminals.create(&endpoint("gpu-1.example.com"), None).await.unwrap();
            let out = terminals
                .execute_in(&id, "cat .env", Duration::from_secs(5))
                .await
                .unwrap();
            assert!(!out.output.contains("abcdef"));
        }

        #[tokio::test]
        async fn test_oversized_output_keeps_tail() {
            let connector = Arc::new(MockConnector::new());
            let flood = format!("{}\nlast line", "y\n".repeat(MAX_SHELL_BUFFER));
            connector.script_shell("yes | head -n 1048576", &flood);
            let terminals = manager(connector, CompletionMode::Sentinel);

            let id = terminals.create(&endpoint("gpu-1.example.com"), None).await.unwrap();
            let out = terminals
                .execute_in(&id, "yes | head -n 1048576", Duration::from_secs(5))
                .await
                .unwrap();
            assert!(out.completed);
            assert!(out.output.len() <= MAX_SHELL_BUFFER);
            assert!(out.output.ends_with("last line"));
        }

        #[tokio::test]
        async fn test_timeout_reports_incomplete() {
            let connector = Arc::new(MockConnector::new());
            connector.hang_shells();
            let terminals = manager(connector, CompletionMode::Sentinel);

            let id = terminals.create(&endpoint("gpu-1.example.com"), None).await.unwrap();
            let out = terminals
                .execute_in(&id, "sleep 60", Duration::from_millis(300))
                .await
                .unwrap();
            assert!(!out.completed);
            assert_eq!(terminals.history(&id).await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_prompt_mode_completes_on_prompt() {
            let connector = Arc::new(MockConnector::new());
            let terminals = manager(connector, CompletionMode::Prompt);

            let id = terminals.create(&endpoint("gpu-1.example.com"), None).await.unwrap();
            let out = terminals
                .execute_in(&id, "true", Duration::from_secs(5))
                .await
                .unwrap();
            assert!(out.completed);
        }

        #[tokio::test]
        async fn test_unknown_session() {
            let connector = Arc::new(MockConnector::new());
            let terminals = manager(connector, CompletionMode::Sentinel);

            let err = terminals
                .execute_in("nope", "ls", Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, HardwareError::SessionNotFound(_)));
        }

        #[tokio::test]
        async fn test_close_is_idempotent() {
            let connector = Arc::new(MockConnector::new());
            let terminals = manager(connector.clone(), CompletionMode::Sentinel);

            let id = terminals.create(&endpoint("gpu-1.example.com"), None).await.unwrap();
            assert!(terminals.close(&id).await);
            assert!(!terminals.close(&id).await);
            assert!(terminals.is_empty());
            assert_eq!(connector.close_count(), 1);

            // A closed id can be reused by a new session
            let again = terminals
                .create(&endpoint("gpu-1.example.com"), Some(id.clone()))
                .await
                .unwrap();
            assert_eq!(again, id);
        }

        #[tokio::test]
        async fn test_list_reports_sessions() {
            let connector = Arc::new(MockConnector::new());
            let terminals = manager(connector, CompletionMode::Sentinel);

            terminals.create(&endpoint("a.example.com"), Some("one".into())).await.unwrap();
            terminals.create(&endpoint("b.example.com"), Some("two".into())).await.unwrap();
            let list = terminals.list().await;
            assert_eq!(list.len(), 2);
            assert!(list.iter().any(|s| s.session_id == "one" && s.endpoint == "a.example.com:22"));
            assert!(list.iter().all(|s| s.interactive && s.history_len == 0));
        }
    }

    mod expiry {
        use super::*;

        #[tokio::test]
        async fn test_sweep_closes_only_idle_sessions() {
            let connector = Arc::new(MockConnector::new());
            let terminals = TerminalManager::new(
                connector,
                Arc::new(SecurityValidator::new(false)),
                Duration::from_secs(60),
                CompletionMode::Sentinel,
            );
            let id = terminals.create(&endpoint("a.example.com"), None).await.unwrap();

            let soon = Utc::now() + chrono::Duration::seconds(30);
            assert_eq!(terminals.sweep_expired_at(soon).await, 0);

            let later = Utc::now() + chrono::Duration::seconds(120);
            assert_eq!(terminals.sweep_expired_at(later).await, 1);
            assert!(terminals.history(&id).await.is_err());
        }

        #[tokio::test]
        async fn test_expiry_boundary_is_strict() {
            let connector = Arc::new(MockConnector::new());
            let terminals = TerminalManager::new(
                connector,
                Arc::new(SecurityValidator::new(false)),
                Duration::from_secs(60),
                CompletionMode::Sentinel,
            );
            let id = terminals.create(&endpoint("a.example.com"), None).await.unwrap();
            let session = terminals.session(&id).unwrap();
            let session = session.lock().await;

            let at_limit = session.last_activity + chrono::Duration::seconds(60);
            assert!(!session.is_expired_at(at_limit));
            assert!(session.is_expired_at(at_limit + chrono::Duration::milliseconds(1)));
        }

        #[tokio::test]
        async fn test_hour_idle_limit() {
            let connector = Arc::new(MockConnector::new());
            let terminals = manager(connector, CompletionMode::Sentinel);
            let id = terminals.create(&endpoint("a.example.com"), None).await.unwrap();
            let session = terminals.session(&id).unwrap();
            let last_activity = session.lock().await.last_activity;

            let idle = |secs| last_activity + chrono::Duration::seconds(secs);
            {
                let session = session.lock().await;
                assert!(!session.is_expired_at(idle(3599)));
                assert!(!session.is_expired_at(idle(3600)));
                assert!(session.is_expired_at(idle(3601)));
            }

            assert_eq!(terminals.sweep_expired_at(idle(3599)).await, 0);
            assert_eq!(terminals.sweep_expired_at(idle(3601)).await, 1);
            assert!(terminals.is_empty());
        }

        #[tokio::test]
        async fn test_close_all() {
            let connector = Arc::new(MockConnector::new());
            let terminals = manager(connector, CompletionMode::Sentinel);
            terminals.create(&endpoint("a.example.com"), None).await.unwrap();
            terminals.create(&endpoint("b.example.com"), None).await.unwrap();

            terminals.close_all().await;
            assert!(terminals.is_empty());
        }
    }
}
