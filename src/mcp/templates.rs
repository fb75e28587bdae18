//! Command-line builders for the template tools.
//!
//! Every user-supplied value is single-quoted with [`shell_quote`] before it
//! reaches a command line. The builders are pure; execution goes through the
//! regular executor so the same rate limit and policy apply.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::mcp::error::{HardwareError, Result};
use crate::mcp::security::{FileAccess, shell_quote};

pub(crate) const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
pub(crate) const DOCKER_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const ENVIRONMENT_TIMEOUT: Duration = Duration::from_secs(300);
pub(crate) const DEFAULT_MONITOR_SECS: u64 = 10;
pub(crate) const DEFAULT_WORKSPACE: &str = "/tmp/ai_workspace";

fn invalid(message: impl Into<String>) -> HardwareError {
    HardwareError::InvalidRequest(message.into())
}

fn required<'a>(value: Option<&'a str>, name: &str, operation: &str) -> Result<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(invalid(format!("'{}' requires {}", operation, name))),
    }
}

fn quote_all(values: &[String]) -> String {
    values
        .iter()
        .map(|v| shell_quote(v))
        .collect::<Vec<_>>()
        .join(" ")
}

// Software installation

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PackageManager {
    #[default]
    Auto,
    Apt,
    Yum,
    Dnf,
    Pip,
    Npm,
}

impl FromStr for PackageManager {
    type Err = HardwareError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "apt" => Ok(Self::Apt),
            "yum" => Ok(Self::Yum),
            "dnf" => Ok(Self::Dnf),
            "pip" => Ok(Self::Pip),
            "npm" => Ok(Self::Npm),
            other => Err(invalid(format!("Unsupported package manager: {}", other))),
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Apt => "apt",
            Self::Yum => "yum",
            Self::Dnf => "dnf",
            Self::Pip => "pip",
            Self::Npm => "npm",
        };
        f.write_str(name)
    }
}

impl PackageManager {
    /// Resolve `Auto` from the endpoint's platform tag. Unknown platforms get apt.
    pub fn resolve(self, platform: &str) -> Self {
        if self != Self::Auto {
            return self;
        }
        let platform = platform.to_ascii_lowercase();
        if platform.contains("centos") || platform.contains("rhel") {
            Self::Yum
        } else {
            Self::Apt
        }
    }
}

/// Build the install command for `packages`. Returns the resolved manager too.
pub fn install_command(
    manager: PackageManager,
    platform: &str,
    packages: &[String],
) -> Result<(PackageManager, String)> {
    if packages.iter().all(|p| p.trim().is_empty()) {
        return Err(invalid("No packages given"));
    }
    let manager = manager.resolve(platform);
    let list = quote_all(packages);
    let command = match manager {
        PackageManager::Apt | PackageManager::Auto => {
            format!("sudo apt update && sudo apt install -y {}", list)
        }
        PackageManager::Yum => format!("sudo yum install -y {}", list),
        PackageManager::Dnf => format!("sudo dnf install -y {}", list),
        PackageManager::Pip => format!("pip install {}", list),
        PackageManager::Npm => format!("npm install -g {}", list),
    };
    Ok((manager, command))
}

// File operations

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    Read,
    Write,
    Append,
    Delete,
    Copy,
    Move,
    Chmod,
    Chown,
}

impl FromStr for FileOperation {
    type Err = HardwareError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "append" => Ok(Self::Append),
            "delete" => Ok(Self::Delete),
            "copy" => Ok(Self::Copy),
            "move" => Ok(Self::Move),
            "chmod" => Ok(Self::Chmod),
            "chown" => Ok(Self::Chown),
            other => Err(invalid(format!("Unsupported file operation: {}", other))),
        }
    }
}

impl FileOperation {
    /// Access the target path is validated for.
    pub fn access(self) -> FileAccess {
        match self {
            Self::Read => FileAccess::Read,
            _ => FileAccess::Write,
        }
    }

    /// Whether the operation needs sudo to run.
    pub fn needs_sudo(self) -> bool {
        self == Self::Chown
    }
}

/// Arguments of a file operation. Paths are expected to be validated.
#[derive(Debug, Default)]
pub struct FileRequest<'a> {
    pub path: &'a str,
    pub content: Option<&'a str>,
    pub destination: Option<&'a str>,
    pub permissions: Option<&'a str>,
    pub owner: Option<&'a str>,
}

pub fn file_command(operation: FileOperation, req: &FileRequest<'_>) -> Result<String> {
    let path = shell_quote(req.path);
    let command = match operation {
        FileOperation::Read => format!("cat {}", path),
        FileOperation::Write => {
            format!("echo {} > {}", shell_quote(req.content.unwrap_or("")), path)
        }
        FileOperation::Append => {
            format!("echo {} >> {}", shell_quote(req.content.unwrap_or("")), path)
        }
        FileOperation::Delete => format!("rm -f {}", path),
        FileOperation::Copy => format!(
            "cp {} {}",
            path,
            shell_quote(required(req.destination, "a destination", "copy")?)
        ),
        FileOperation::Move => format!(
            "mv {} {}",
            path,
            shell_quote(required(req.destination, "a destination", "move")?)
        ),
        FileOperation::Chmod => {
            let mode = req.permissions.unwrap_or("644");
            if mode.is_empty() || !mode.chars().all(|c| c.is_ascii_digit() && c < '8') {
                return Err(invalid(format!("Invalid permissions: {}", mode)));
            }
            format!("chmod {} {}", mode, path)
        }
        FileOperation::Chown => format!(
            "sudo chown {} {}",
            shell_quote(required(req.owner, "an owner", "chown")?),
            path
        ),
    };
    Ok(command)
}

// System monitoring

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cpu,
    Memory,
    Disk,
    Network,
    Processes,
    Gpu,
    All,
}

impl FromStr for Metric {
    type Err = HardwareError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "memory" => Ok(Self::Memory),
            "disk" => Ok(Self::Disk),
            "network" => Ok(Self::Network),
            "processes" => Ok(Self::Processes),
            "gpu" => Ok(Self::Gpu),
            "all" => Ok(Self::All),
            other => Err(invalid(format!("Unknown metric: {}", other))),
        }
    }
}

const MONITORING_COMMANDS: &[(Metric, &str, &str)] = &[
    (Metric::Cpu, "cpu", "top -bn1 | grep 'Cpu(s)' | head -1"),
    (Metric::Memory, "memory", "free -h"),
    (Metric::Disk, "disk", "df -h"),
    (Metric::Network, "network", "ss -tuln | head -10"),
    (Metric::Processes, "processes", "ps aux --sort=-%cpu | head -10"),
    (
        Metric::Gpu,
        "gpu",
        "nvidia-smi 2>/dev/null || echo 'No NVIDIA GPU detected'",
    ),
];

/// Labelled commands for the requested metrics, in a fixed order.
/// An empty selection means all metrics.
pub fn monitoring_commands(metrics: &[Metric]) -> Vec<(&'static str, &'static str)> {
    let all = metrics.is_empty() || metrics.contains(&Metric::All);
    MONITORING_COMMANDS
        .iter()
        .filter(|(metric, _, _)| all || metrics.contains(metric))
        .map(|(_, label, command)| (*label, *command))
        .collect()
}

// Docker

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerOperation {
    List,
    Run,
    Exec,
    Stop,
    Remove,
    Build,
    Pull,
    Logs,
    Inspect,
}

impl FromStr for DockerOperation {
    type Err = HardwareError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "list" => Ok(Self::List),
            "run" => Ok(Self::Run),
            "exec" => Ok(Self::Exec),
            "stop" => Ok(Self::Stop),
            "remove" => Ok(Self::Remove),
            "build" => Ok(Self::Build),
            "pull" => Ok(Self::Pull),
            "logs" => Ok(Self::Logs),
            "inspect" => Ok(Self::Inspect),
            other => Err(invalid(format!("Unsupported docker operation: {}", other))),
        }
    }
}

#[derive(Debug)]
pub struct DockerRequest<'a> {
    pub container: Option<&'a str>,
    pub image: Option<&'a str>,
    /// Command line run inside the container, passed through unquoted
    pub command: Option<&'a str>,
    pub detach: bool,
    pub interactive: bool,
    pub remove: bool,
    pub build_path: Option<&'a str>,
}

impl Default for DockerRequest<'_> {
    fn default() -> Self {
        Self {
            container: None,
            image: None,
            command: None,
            detach: false,
            interactive: false,
            remove: true,
            build_path: None,
        }
    }
}

pub fn docker_command(operation: DockerOperation, req: &DockerRequest<'_>) -> Result<String> {
    let container = || required(req.container, "a container_name", "docker").map(shell_quote);
    let image = || required(req.image, "an image", "docker").map(shell_quote);
    let inner = req.command.map(str::trim).filter(|c| !c.is_empty());

    let command = match operation {
        DockerOperation::List => "docker ps -a".to_string(),
        DockerOperation::Run => {
            let mut cmd = String::from("docker run");
            if req.detach {
                cmd.push_str(" -d");
            }
            if req.interactive {
                cmd.push_str(" -it");
            }
            if req.remove {
                cmd.push_str(" --rm");
            }
            cmd.push(' ');
            cmd.push_str(&image()?);
            if let Some(inner) = inner {
                cmd.push(' ');
                cmd.push_str(inner);
            }
            cmd
        }
        DockerOperation::Exec => {
            let inner = inner.ok_or_else(|| invalid("'exec' requires a command"))?;
            let flags = if req.interactive { " -it" } else { "" };
            format!("docker exec{} {} {}", flags, container()?, inner)
        }
        DockerOperation::Stop => format!("docker stop {}", container()?),
        DockerOperation::Remove => format!("docker rm {}", container()?),
        DockerOperation::Build => format!(
            "docker build -t {} {}",
            image()?,
            shell_quote(req.build_path.unwrap_or("."))
        ),
        DockerOperation::Pull => format!("docker pull {}", image()?),
        DockerOperation::Logs => format!("docker logs {}", container()?),
        DockerOperation::Inspect => format!("docker inspect {}", container()?),
    };
    Ok(command)
}

// Bulk transfer

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOperation {
    /// `source` is file content written to `destination`
    Upload,
    /// `source` is a remote file printed back
    Download,
    /// Copy `files` (or everything under `source`) into `destination`
    Sync,
}

impl FromStr for TransferOperation {
    type Err = HardwareError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            "sync" => Ok(Self::Sync),
            other => Err(invalid(format!("Unsupported transfer operation: {}", other))),
        }
    }
}

impl fmt::Display for TransferOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
            Self::Sync => f.write_str("sync"),
        }
    }
}

fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let (parent, _) = trimmed.rsplit_once('/')?;
    if parent.is_empty() { Some("/") } else { Some(parent) }
}

pub fn transfer_command(
    operation: TransferOperation,
    source: &str,
    destination: &str,
    files: &[String],
) -> Result<String> {
    let command = match operation {
        TransferOperation::Upload => {
            let dest = required(Some(destination), "a destination", "upload")?;
            let write = format!("echo {} > {}", shell_quote(source), shell_quote(dest));
            match parent_dir(dest) {
                Some(dir) => format!("mkdir -p {} && {}", shell_quote(dir), write),
                None => write,
            }
        }
        TransferOperation::Download => {
            format!("cat {}", shell_quote(required(Some(source), "a source", "download")?))
        }
        TransferOperation::Sync => {
            let dest = shell_quote(required(Some(destination), "a destination", "sync")?);
            let files: Vec<String> = files
                .iter()
                .filter(|f| !f.trim().is_empty())
                .cloned()
                .collect();
            if files.is_empty() {
                let src = required(Some(source), "a source", "sync")?;
                format!(
                    "mkdir -p {} && cp -r {} {}",
                    dest,
                    shell_quote(&format!("{}/.", src.trim_end_matches('/'))),
                    dest
                )
            } else {
                format!("mkdir -p {} && cp -r {} {}", dest, quote_all(&files), dest)
            }
        }
    };
    Ok(command)
}

// Environment setup

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentKind {
    Python,
    Node,
    Docker,
    Conda,
    /// Workspace directory only
    Custom,
}

impl FromStr for EnvironmentKind {
    type Err = HardwareError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "python" => Ok(Self::Python),
            "node" => Ok(Self::Node),
            "docker" => Ok(Self::Docker),
            "conda" => Ok(Self::Conda),
            "custom" => Ok(Self::Custom),
            other => Err(invalid(format!("Unsupported environment type: {}", other))),
        }
    }
}

const MINICONDA_URL: &str =
    "https://repo.anaconda.com/miniconda/Miniconda3-latest-Linux-x86_64.sh";

/// One `&&`-joined command line that prepares `workspace`.
pub fn environment_command(
    kind: EnvironmentKind,
    requirements: &[String],
    workspace: &str,
) -> String {
    let workspace = shell_quote(workspace);
    let mut steps = vec![format!("mkdir -p {}", workspace), format!("cd {}", workspace)];
    let requirements: Vec<&String> = requirements
        .iter()
        .filter(|r| !r.trim().is_empty())
        .collect();

    match kind {
        EnvironmentKind::Python => {
            steps.push("python3 -m venv venv".to_string());
            steps.push("source venv/bin/activate".to_string());
            steps.extend(
                requirements
                    .iter()
                    .map(|r| format!("pip install {}", shell_quote(r))),
            );
        }
        EnvironmentKind::Node => {
            steps.push("npm init -y".to_string());
            steps.extend(
                requirements
                    .iter()
                    .map(|r| format!("npm install {}", shell_quote(r))),
            );
        }
        EnvironmentKind::Docker => {
            if let Some((base, run)) = requirements.split_first() {
                let mut lines = vec![format!("FROM {}", base)];
                if !run.is_empty() {
                    let run: Vec<&str> = run.iter().map(|r| r.as_str()).collect();
                    lines.push(format!("RUN {}", run.join(" && ")));
                }
                for (i, line) in lines.iter().enumerate() {
                    let redirect = if i == 0 { ">" } else { ">>" };
                    steps.push(format!("echo {} {} Dockerfile", shell_quote(line), redirect));
                }
            }
        }
        EnvironmentKind::Conda => {
            steps.push(format!("wget -O miniconda.sh {}", MINICONDA_URL));
            steps.push("bash miniconda.sh -b -p ./miniconda".to_string());
            steps.push("source ./miniconda/bin/activate".to_string());
            steps.extend(
                requirements
                    .iter()
                    .map(|r| format!("conda install -y {}", shell_quote(r))),
            );
        }
        EnvironmentKind::Custom => {}
    }
    steps.join(" && ")
}
