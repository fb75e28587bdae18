//! In-memory transport for unit tests.
//!
//! [`MockConnector`] hands out connections that answer `echo` like a shell,
//! return scripted output for other commands, and open shells that mimic a
//! PTY: input is echoed back, then the command's scripted output and a
//! prompt follow.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::mcp::endpoint::{Endpoint, EndpointSpec};
use crate::mcp::error::TransportError;
use crate::mcp::transport::{
    CommandOutput, ConnectMode, Connector, RemoteConnection, ShellChannel,
};

/// Valid endpoint with defaults, for tests.
pub(crate) fn endpoint(hostname: &str) -> Endpoint {
    EndpointSpec::new(hostname, "agent", "/keys/id_ed25519")
        .build()
        .unwrap()
}

/// Shared script consulted by every mock connection and shell.
#[derive(Default)]
pub(crate) struct MockScript {
    exec: Mutex<HashMap<String, Result<CommandOutput, TransportError>>>,
    shell: Mutex<HashMap<String, String>>,
    executed: Mutex<Vec<String>>,
    shell_hangs: AtomicBool,
}

impl MockScript {
    fn exec_response(&self, command: &str) -> Result<CommandOutput, TransportError> {
        if let Some(response) = self.exec.lock().unwrap().get(command) {
            return response.clone();
        }
        if let Some(text) = command.strip_prefix("echo ") {
            return Ok(CommandOutput {
                stdout: format!("{}\n", text.replace(['"', '\''], "")),
                stderr: String::new(),
                exit_code: Some(0),
            });
        }
        Ok(CommandOutput {
            exit_code: Some(0),
            ..Default::default()
        })
    }
}

#[derive(Default)]
pub(crate) struct MockConnector {
    script: Arc<MockScript>,
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
    failing_hosts: Mutex<HashSet<String>>,
    open: Mutex<Vec<Arc<AtomicBool>>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make every connection attempt to `hostname` fail.
    pub(crate) fn fail_host(&self, hostname: &str) {
        self.failing_hosts
            .lock()
            .unwrap()
            .insert(hostname.to_string());
    }

    pub(crate) fn restore_host(&self, hostname: &str) {
        self.failing_hosts.lock().unwrap().remove(hostname);
    }

    pub(crate) fn script_exec(
        &self,
        command: &str,
        response: Result<CommandOutput, TransportError>,
    ) {
        self.script
            .exec
            .lock()
            .unwrap()
            .insert(command.to_string(), response);
    }

    pub(crate) fn script_stdout(&self, command: &str, stdout: &str) {
        self.script_exec(
            command,
            Ok(CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: Some(0),
            }),
        );
    }

    pub(crate) fn script_shell(&self, command: &str, output: &str) {
        self.script
            .shell
            .lock()
            .unwrap()
            .insert(command.to_string(), output.to_string());
    }

    /// Shells stop answering: no output, no sentinel, no prompt.
    pub(crate) fn hang_shells(&self) {
        self.script.shell_hangs.store(true, Ordering::SeqCst);
    }

    /// Break every connection handed out so far.
    pub(crate) fn kill_open_connections(&self) {
        for alive in self.open.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn executed(&self) -> Vec<String> {
        self.script.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _mode: ConnectMode,
    ) -> Result<Box<dyn RemoteConnection>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_hosts
            .lock()
            .unwrap()
            .contains(endpoint.hostname())
        {
            return Err(TransportError::Io(format!(
                "Failed to connect to {}: Connection refused",
                endpoint.key()
            )));
        }

        let alive = Arc::new(AtomicBool::new(true));
        self.open.lock().unwrap().push(alive.clone());
        Ok(Box::new(MockConnection {
            script: self.script.clone(),
            alive,
            closes: self.closes.clone(),
        }))
    }
}

struct MockConnection {
    script: Arc<MockScript>,
    alive: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl RemoteConnection for MockConnection {
    async fn exec(
        &self,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Io("Channel closed".to_string()));
        }
        self.script.executed.lock().unwrap().push(command.to_string());
        self.script.exec_response(command)
    }

    async fn open_shell(&self) -> Result<Box<dyn ShellChannel>, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Io("Channel closed".to_string()));
        }
        let shell = MockShell {
            script: self.script.clone(),
            buffer: Mutex::new(b"Welcome\r\n$ ".to_vec()),
            pending: Mutex::new(String::new()),
            closed: AtomicBool::new(false),
        };
        Ok(Box::new(shell))
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockShell {
    script: Arc<MockScript>,
    buffer: Mutex<Vec<u8>>,
    pending: Mutex<String>,
    closed: AtomicBool,
}

impl MockShell {
    fn respond(&self, line: &str) -> String {
        if let Some(rest) = line.strip_prefix("echo ") {
            return format!("{}\r\n", rest.replace('"', ""));
        }
        self.script
            .shell
            .lock()
            .unwrap()
            .get(line)
            .map(|out| format!("{}\r\n", out.replace('\n', "\r\n")))
            .unwrap_or_default()
    }
}

#[async_trait]
impl ShellChannel for MockShell {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Io("Shell channel is closed".to_string()));
        }
        let hangs = self.script.shell_hangs.load(Ordering::SeqCst);
        let mut pending = self.pending.lock().unwrap();
        pending.push_str(&String::from_utf8_lossy(data));

        let mut buffer = self.buffer.lock().unwrap();
        while let Some(pos) = pending.find('\n') {
            let line: String = pending.drain(..=pos).collect();
            let line = line.trim_end();
            // PTY echo of the typed line
            buffer.extend_from_slice(format!("{}\r\n", line).as_bytes());
            if !hangs {
                buffer.extend_from_slice(self.respond(line).as_bytes());
                buffer.extend_from_slice(b"$ ");
            }
        }
        Ok(())
    }

    async fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer.lock().unwrap())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
