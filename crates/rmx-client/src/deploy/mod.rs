//! Remote agent deployment
//!
//! `ensure_agent_running` walks a fixed sequence and stops at the first
//! step that leaves a healthy agent:
//!
//! 1. health check against the agent port
//! 2. runtime check (fatal if the host is too old)
//! 3. installed-but-stopped: start it and wait for health
//! 4. fresh install: upload, install, mark executable, start, wait
//!
//! Concurrent calls for one connection share a single in-flight run.

mod bundle;
mod remote;
mod version;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;

use rmx_core::config::DeployConfig;
use rmx_core::time::current_time_millis;
use rmx_core::{ConnectError, ConnectionId};
use rmx_protocol::HealthResponse;

use crate::connection::{CommandOutput, RemoteAgentRecord, UploadFile};
use crate::error::{DeployError, DeployStep};

pub use bundle::{Bundle, BundleFile, STAMP_FILE};
pub use version::{parse_version, version_at_least};

/// Agent log file, relative to the install directory
pub const AGENT_LOG: &str = "agent.log";

/// Timeout for a single health request
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// What a deployer needs from the remote side
#[async_trait]
pub trait RemoteHost: Send + Sync + 'static {
    fn id(&self) -> &ConnectionId;

    /// Query the agent's `/health` on the remote loopback; `None` if unreachable
    async fn agent_health(&self, port: u16, timeout: Duration) -> Option<HealthResponse>;

    /// Run a shell command in the login home; `None` means no timeout
    async fn exec(&self, command: &str, timeout: Option<Duration>) -> Result<CommandOutput, ConnectError>;

    /// Upload files over SFTP
    async fn upload(&self, files: &[UploadFile]) -> Result<u64, ConnectError>;

    /// Store what was learned about the agent
    fn record(&self, record: RemoteAgentRecord);
}

/// How the agent came to be running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    /// It was already healthy
    AlreadyRunning,
    /// Installed files were started
    Started,
    /// Installed from scratch, then started
    Installed,
}

/// Result of a successful deployment
#[derive(Debug, Clone)]
pub struct DeployReport {
    pub outcome: DeployOutcome,
    pub runtime_version: Option<String>,
    pub health: HealthResponse,
}

type SharedDeploy = Shared<BoxFuture<'static, Result<DeployReport, DeployError>>>;

/// Deploys and starts the remote agent, at most once at a time per connection
pub struct Deployer {
    config: Arc<DeployConfig>,
    inflight: Arc<DashMap<ConnectionId, SharedDeploy>>,
}

impl Deployer {
    pub fn new(config: DeployConfig) -> Self {
        Self {
            config: Arc::new(config),
            inflight: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Whether a deployment is currently running for `id`
    pub fn is_deploying(&self, id: &ConnectionId) -> bool {
        self.inflight.contains_key(id)
    }

    /// Make sure the agent is running on `host`.
    ///
    /// A second caller for the same connection awaits the first caller's
    /// run instead of starting its own. `cancel` aborts the run (normally
    /// the connection's lifetime token).
    pub async fn ensure_agent_running<H: RemoteHost>(
        &self,
        host: Arc<H>,
        cancel: CancellationToken,
    ) -> Result<DeployReport, DeployError> {
        let id = host.id().clone();
        let deployment = self
            .inflight
            .entry(id.clone())
            .or_insert_with(|| {
                let inflight = Arc::clone(&self.inflight);
                let config = Arc::clone(&self.config);
                let key = id.clone();
                async move {
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(DeployError::Cancelled),
                        result = deploy(config, host) => result,
                    };
                    inflight.remove(&key);
                    result
                }
                .boxed()
                .shared()
            })
            .clone();

        deployment.await
    }
}

async fn deploy<H: RemoteHost>(
    config: Arc<DeployConfig>,
    host: Arc<H>,
) -> Result<DeployReport, DeployError> {
    let run = Deployment {
        config: &config,
        host: host.as_ref(),
        dir: remote_dir(&config.remote_dir),
    };

    // 1. Already running?
    if let Some(health) = run.health_check().await {
        tracing::info!(connection_id = %host.id(), step = %DeployStep::HealthCheck, "Agent already healthy");
        run.record(true, None, &health);
        return Ok(DeployReport {
            outcome: DeployOutcome::AlreadyRunning,
            runtime_version: None,
            health,
        });
    }

    // 2. Compatible runtime?
    let runtime_version = run.runtime_check().await?;

    // 3. Installed but stopped?
    let bundle = load_bundle(&config).await;
    if run.installed_check(bundle.as_ref()).await? {
        run.start().await?;
        let health = run.wait_healthy().await?;
        run.record(true, Some(runtime_version.clone()), &health);
        return Ok(DeployReport {
            outcome: DeployOutcome::Started,
            runtime_version: Some(runtime_version),
            health,
        });
    }

    // 4. Fresh install
    let bundle = bundle.map_err(|e| DeployError::install(DeployStep::PrepareBundle, e))?;
    run.install(&bundle).await?;
    run.start().await?;
    let health = run.wait_healthy().await?;
    run.record(true, Some(runtime_version.clone()), &health);

    Ok(DeployReport {
        outcome: DeployOutcome::Installed,
        runtime_version: Some(runtime_version),
        health,
    })
}

/// Scan the local bundle off the async threads
async fn load_bundle(config: &DeployConfig) -> Result<Bundle, String> {
    let root = config.bundle_dir.clone();
    let exclude = config.exclude.clone();
    let entry_point = config.entry_point.clone();

    let scanned = tokio::task::spawn_blocking(move || Bundle::scan(&root, &exclude))
        .await
        .map_err(|e| format!("bundle scan aborted: {}", e))?
        .map_err(|e| format!("cannot read bundle {}: {}", config.bundle_dir.display(), e))?;

    if !scanned.contains(&entry_point) {
        return Err(format!(
            "bundle {} has no entry point '{}'",
            config.bundle_dir.display(),
            entry_point
        ));
    }
    Ok(scanned)
}

/// Install directory as used in shell commands and SFTP paths (home-relative)
fn remote_dir(configured: &str) -> String {
    let dir = configured.trim();
    let dir = dir.strip_prefix("~/").unwrap_or(dir);
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() || dir == "~" {
        ".".to_string()
    } else {
        dir.to_string()
    }
}

/// Single-quote for POSIX sh
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

struct Deployment<'a, H: RemoteHost> {
    config: &'a DeployConfig,
    host: &'a H,
    dir: String,
}

impl<'a, H: RemoteHost> Deployment<'a, H> {
    fn path(&self, relative: &str) -> String {
        format!("{}/{}", self.dir, relative)
    }

    async fn health_check(&self) -> Option<HealthResponse> {
        self.host
            .agent_health(self.config.agent_port, HEALTH_TIMEOUT)
            .await
            .filter(HealthResponse::is_ok)
    }

    fn record(&self, healthy: bool, runtime_version: Option<String>, health: &HealthResponse) {
        if let Some(protocol) = health.protocol.as_deref() {
            if protocol != rmx_protocol::PROTOCOL_VERSION {
                tracing::warn!(
                    connection_id = %self.host.id(),
                    "Agent speaks stream protocol {}, expected {}",
                    protocol,
                    rmx_protocol::PROTOCOL_VERSION
                );
            }
        }
        self.host.record(RemoteAgentRecord {
            installed: true,
            runtime_version,
            agent_version: health.version.clone(),
            last_health_check: Some(current_time_millis()),
            healthy,
        });
    }

    /// Run one step's command, logging its outcome with output tails
    async fn run(
        &self,
        step: DeployStep,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, DeployError> {
        tracing::debug!(connection_id = %self.host.id(), step = %step, "Running: {}", command);
        let output = self.host.exec(command, timeout).await.map_err(|e| match e {
            ConnectError::CommandTimeout(_) | ConnectError::Channel(_) => {
                DeployError::install(step, e.to_string())
            }
            other => DeployError::Connection(other),
        })?;

        if output.success() {
            tracing::info!(
                connection_id = %self.host.id(),
                step = %step,
                exit_code = ?output.exit_code,
                "Step ok"
            );
        } else {
            tracing::warn!(
                connection_id = %self.host.id(),
                step = %step,
                exit_code = ?output.exit_code,
                stdout = %output.stdout_tail(),
                stderr = %output.stderr_tail(),
                "Step failed"
            );
        }
        Ok(output)
    }

    async fn runtime_check(&self) -> Result<String, DeployError> {
        let runtime = &self.config.runtime;
        let output = self
            .run(
                DeployStep::RuntimeCheck,
                &runtime.command,
                Some(self.config.command_timeout),
            )
            .await
            .map_err(|e| match e {
                DeployError::Install { message, .. } => DeployError::Runtime(message),
                other => other,
            })?;

        let combined = format!("{}\n{}", output.stdout, output.stderr);
        let found = parse_version(&combined).ok_or_else(|| {
            DeployError::Runtime(format!(
                "{} not found (exit {:?}): {}",
                runtime.name,
                output.exit_code,
                crate::connection::tail(&combined)
            ))
        })?;

        if !version_at_least(&found, &runtime.min_version) {
            return Err(DeployError::Runtime(format!(
                "{} {} is older than required {}",
                runtime.name, found, runtime.min_version
            )));
        }
        tracing::info!(connection_id = %self.host.id(), "Remote {} {}", runtime.name, found);
        Ok(found)
    }

    /// Entry point executable and, when the local bundle is known, stamp matches
    async fn installed_check(&self, bundle: Result<&Bundle, &String>) -> Result<bool, DeployError> {
        let command = format!(
            "test -x {} && cat {} 2>/dev/null; test -x {}",
            quote(&self.path(&self.config.entry_point)),
            quote(&self.path(STAMP_FILE)),
            quote(&self.path(&self.config.entry_point)),
        );
        let output = self
            .run(
                DeployStep::InstalledCheck,
                &command,
                Some(self.config.command_timeout),
            )
            .await?;

        if !output.success() {
            tracing::info!(connection_id = %self.host.id(), "Agent not installed");
            return Ok(false);
        }

        match bundle {
            Ok(bundle) => {
                let current = output.stdout.trim() == bundle.stamp;
                if !current {
                    tracing::info!(connection_id = %self.host.id(), "Installed agent is stale");
                }
                Ok(current)
            }
            Err(reason) => {
                tracing::warn!(
                    connection_id = %self.host.id(),
                    "Local bundle unavailable ({}); using installed agent as is",
                    reason
                );
                Ok(true)
            }
        }
    }

    async fn install(&self, bundle: &Bundle) -> Result<(), DeployError> {
        let timeout = Some(self.config.command_timeout);
        let require = |step: DeployStep, output: CommandOutput| {
            if output.success() {
                Ok(())
            } else {
                Err(DeployError::install(
                    step,
                    format!(
                        "exit code {:?}: {}",
                        output.exit_code,
                        output.stderr_tail()
                    ),
                ))
            }
        };

        let mkdir = format!("mkdir -p {}", quote(&self.dir));
        require(
            DeployStep::CreateDirectory,
            self.run(DeployStep::CreateDirectory, &mkdir, timeout).await?,
        )?;

        let files: Vec<UploadFile> = bundle
            .files
            .iter()
            .map(|f| UploadFile {
                local: f.path.clone(),
                remote: self.path(&f.relative),
            })
            .collect();
        tracing::info!(
            connection_id = %self.host.id(),
            step = %DeployStep::Upload,
            "Uploading {} file(s)",
            files.len()
        );
        let bytes = self
            .host
            .upload(&files)
            .await
            .map_err(|e| DeployError::install(DeployStep::Upload, e.to_string()))?;
        tracing::info!(connection_id = %self.host.id(), step = %DeployStep::Upload, "Uploaded {} bytes", bytes);

        if let Some(install) = &self.config.install_command {
            // Dependency installs may be slow; cancellation still applies
            let command = format!("cd {} && {}", quote(&self.dir), install);
            require(
                DeployStep::InstallDependencies,
                self.run(DeployStep::InstallDependencies, &command, None).await?,
            )?;
        }

        let chmod = format!("chmod +x {}", quote(&self.path(&self.config.entry_point)));
        require(
            DeployStep::MarkExecutable,
            self.run(DeployStep::MarkExecutable, &chmod, timeout).await?,
        )?;

        let stamp = format!(
            "printf '%s' {} > {}",
            quote(&bundle.stamp),
            quote(&self.path(STAMP_FILE))
        );
        require(
            DeployStep::WriteStamp,
            self.run(DeployStep::WriteStamp, &stamp, timeout).await?,
        )
    }

    /// Start the agent detached from the SSH channel
    async fn start(&self) -> Result<(), DeployError> {
        let command = format!(
            "cd {dir} && RMX_AGENT_PORT={port} RMX_AGENT_IDLE_TIMEOUT_MINUTES={idle} \
             RMX_AGENT_IDLE_SHUTDOWN={enabled} nohup ./{entry} > {log} 2>&1 < /dev/null &",
            dir = quote(&self.dir),
            port = self.config.agent_port,
            idle = self.config.agent_idle_timeout_minutes,
            enabled = self.config.agent_idle_timeout_minutes > 0,
            entry = quote(&self.config.entry_point),
            log = AGENT_LOG,
        );
        let output = self
            .run(DeployStep::Start, &command, Some(self.config.command_timeout))
            .await?;
        if !output.success() {
            return Err(DeployError::install(
                DeployStep::Start,
                format!("exit code {:?}: {}", output.exit_code, output.stderr_tail()),
            ));
        }
        Ok(())
    }

    /// Poll health with bounded retries; on failure report the agent log tail
    async fn wait_healthy(&self) -> Result<HealthResponse, DeployError> {
        let attempts = self.config.health_retries.max(1);
        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.health_retry_delay).await;
            if let Some(health) = self.health_check().await {
                tracing::info!(
                    connection_id = %self.host.id(),
                    "Agent healthy after {} check(s)",
                    attempt
                );
                return Ok(health);
            }
        }

        let log_command = format!("tail -n 20 {} 2>&1", quote(&self.path(AGENT_LOG)));
        let log_tail = match self
            .host
            .exec(&log_command, Some(self.config.command_timeout))
            .await
        {
            Ok(output) => output.stdout_tail(),
            Err(e) => format!("<unavailable: {}>", e),
        };
        tracing::warn!(connection_id = %self.host.id(), log = %log_tail, "Agent did not become healthy");

        self.host.record(RemoteAgentRecord {
            installed: true,
            runtime_version: None,
            agent_version: None,
            last_health_check: Some(current_time_millis()),
            healthy: false,
        });
        Err(DeployError::Unhealthy { attempts, log_tail })
    }
}
