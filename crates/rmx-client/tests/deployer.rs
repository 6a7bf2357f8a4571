//! Agent deployment against a scripted remote host

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rmx_client::connection::{CommandOutput, RemoteAgentRecord, UploadFile};
use rmx_client::deploy::Bundle;
use rmx_client::{DeployError, DeployOutcome, Deployer, RemoteHost};
use rmx_core::config::DeployConfig;
use rmx_core::{ConnectError, ConnectionId};
use rmx_protocol::HealthResponse;

/// Pretends to be a remote shell with just enough behaviour for the deployer
struct FakeHost {
    id: ConnectionId,
    runtime_output: String,
    installed: AtomicBool,
    stamp: Mutex<Option<String>>,
    running: AtomicBool,
    /// When false, starting the agent never makes it healthy
    start_works: bool,
    uploads: AtomicUsize,
    uploaded_files: Mutex<Vec<String>>,
    commands: Mutex<Vec<String>>,
    records: Mutex<Vec<RemoteAgentRecord>>,
}

impl FakeHost {
    fn new() -> Self {
        Self {
            id: ConnectionId::new("fake"),
            runtime_output: "ldd (GNU libc) 2.35".to_string(),
            installed: AtomicBool::new(false),
            stamp: Mutex::new(None),
            running: AtomicBool::new(false),
            start_works: true,
            uploads: AtomicUsize::new(0),
            uploaded_files: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            records: Mutex::new(Vec::new()),
        }
    }

    fn installed_with(self, stamp: &str) -> Self {
        self.installed.store(true, Ordering::SeqCst);
        *self.stamp.lock().unwrap() = Some(stamp.to_string());
        self
    }

    fn ran(&self, prefix: &str) -> bool {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.starts_with(prefix))
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }
}

#[async_trait]
impl RemoteHost for FakeHost {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn agent_health(&self, _port: u16, _timeout: Duration) -> Option<HealthResponse> {
        self.running.load(Ordering::SeqCst).then(|| HealthResponse {
            status: "ok".to_string(),
            version: Some("0.1.0".to_string()),
            sessions: 0,
            protocol: Some(rmx_protocol::PROTOCOL_VERSION.to_string()),
        })
    }

    async fn exec(
        &self,
        command: &str,
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput, ConnectError> {
        self.commands.lock().unwrap().push(command.to_string());

        if command.starts_with("ldd") {
            return Ok(Self::ok(&self.runtime_output));
        }
        if command.starts_with("test -x") {
            if !self.installed.load(Ordering::SeqCst) {
                return Ok(CommandOutput {
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            let stamp = self.stamp.lock().unwrap().clone().unwrap_or_default();
            return Ok(Self::ok(&stamp));
        }
        if command.starts_with("printf") {
            // printf '%s' '<stamp>' > '<file>'
            let stamp = command.split('\'').nth(3).unwrap_or_default().to_string();
            *self.stamp.lock().unwrap() = Some(stamp);
            self.installed.store(true, Ordering::SeqCst);
            return Ok(Self::ok(""));
        }
        if command.contains("nohup") {
            if self.start_works {
                self.running.store(true, Ordering::SeqCst);
            }
            return Ok(Self::ok(""));
        }
        if command.starts_with("tail") {
            return Ok(Self::ok("error: address already in use\n"));
        }
        Ok(Self::ok(""))
    }

    async fn upload(&self, files: &[UploadFile]) -> Result<u64, ConnectError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        // Long enough for a concurrent caller to arrive mid-install
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut uploaded = self.uploaded_files.lock().unwrap();
        uploaded.extend(files.iter().map(|f| f.remote.clone()));
        Ok(files.len() as u64)
    }

    fn record(&self, record: RemoteAgentRecord) {
        self.records.lock().unwrap().push(record);
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: DeployConfig,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rmx-agent"), b"#!/bin/sh\n").unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib").join("helper.sh"), b"echo hi\n").unwrap();
        std::fs::create_dir(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("target").join("big.bin"), b"cache").unwrap();

        let config = DeployConfig {
            bundle_dir: dir.path().to_path_buf(),
            health_retries: 3,
            health_retry_delay: Duration::from_millis(10),
            ..DeployConfig::default()
        };
        Self { _dir: dir, config }
    }

    fn stamp(&self) -> String {
        Bundle::scan(&self.config.bundle_dir, &self.config.exclude)
            .unwrap()
            .stamp
    }
}

#[tokio::test]
async fn test_fresh_install_runs_every_step() {
    let fixture = Fixture::new();
    let deployer = Deployer::new(fixture.config.clone());
    let host = Arc::new(FakeHost::new());

    let report = deployer
        .ensure_agent_running(Arc::clone(&host), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, DeployOutcome::Installed);
    assert_eq!(report.runtime_version.as_deref(), Some("2.35"));
    assert!(report.health.is_ok());
    assert!(host.ran("mkdir -p '.remux/agent'"));
    assert!(host.ran("chmod +x '.remux/agent/rmx-agent'"));
    assert_eq!(host.uploads.load(Ordering::SeqCst), 1);

    let uploaded = host.uploaded_files.lock().unwrap().clone();
    assert!(uploaded.contains(&".remux/agent/rmx-agent".to_string()));
    assert!(uploaded.contains(&".remux/agent/lib/helper.sh".to_string()));
    assert!(uploaded.iter().all(|f| !f.contains("target")));

    assert_eq!(*host.stamp.lock().unwrap(), Some(fixture.stamp()));
    let records = host.records.lock().unwrap();
    assert!(records.last().unwrap().healthy);
}

#[tokio::test]
async fn test_concurrent_calls_share_one_install() {
    let fixture = Fixture::new();
    let deployer = Deployer::new(fixture.config.clone());
    let host = Arc::new(FakeHost::new());

    let (a, b) = tokio::join!(
        deployer.ensure_agent_running(Arc::clone(&host), CancellationToken::new()),
        deployer.ensure_agent_running(Arc::clone(&host), CancellationToken::new()),
    );

    assert_eq!(a.unwrap().outcome, DeployOutcome::Installed);
    assert_eq!(b.unwrap().outcome, DeployOutcome::Installed);
    assert_eq!(host.uploads.load(Ordering::SeqCst), 1);
    assert!(!deployer.is_deploying(&host.id));
}

#[tokio::test]
async fn test_healthy_agent_skips_install() {
    let fixture = Fixture::new();
    let deployer = Deployer::new(fixture.config.clone());
    let host = Arc::new(FakeHost::new());
    host.running.store(true, Ordering::SeqCst);

    let report = deployer
        .ensure_agent_running(Arc::clone(&host), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, DeployOutcome::AlreadyRunning);
    assert!(host.commands.lock().unwrap().is_empty());
    assert_eq!(host.uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_installed_agent_is_started() {
    let fixture = Fixture::new();
    let deployer = Deployer::new(fixture.config.clone());
    let host = Arc::new(FakeHost::new().installed_with(&fixture.stamp()));

    let report = deployer
        .ensure_agent_running(Arc::clone(&host), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, DeployOutcome::Started);
    assert!(host.ran("cd '.remux/agent' && RMX_AGENT_PORT=7777"));
    assert_eq!(host.uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stale_install_is_replaced() {
    let fixture = Fixture::new();
    let deployer = Deployer::new(fixture.config.clone());
    let host = Arc::new(FakeHost::new().installed_with("outdated"));

    let report = deployer
        .ensure_agent_running(Arc::clone(&host), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, DeployOutcome::Installed);
    assert_eq!(host.uploads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_old_runtime_is_fatal() {
    let fixture = Fixture::new();
    let deployer = Deployer::new(fixture.config.clone());
    let host = Arc::new(FakeHost {
        runtime_output: "ldd (GNU libc) 2.12".to_string(),
        ..FakeHost::new()
    });

    let err = deployer
        .ensure_agent_running(Arc::clone(&host), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Runtime(ref m) if m.contains("2.12")));
    assert_eq!(host.uploads.load(Ordering::SeqCst), 0);
    assert!(!host.ran("mkdir"));
}

#[tokio::test]
async fn test_unhealthy_start_reports_log_tail() {
    let fixture = Fixture::new();
    let deployer = Deployer::new(fixture.config.clone());
    let host = Arc::new(FakeHost {
        start_works: false,
        ..FakeHost::new()
    });

    let err = deployer
        .ensure_agent_running(Arc::clone(&host), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        DeployError::Unhealthy { attempts, log_tail } => {
            assert_eq!(attempts, 3);
            assert!(log_tail.contains("address already in use"));
        }
        other => panic!("unexpected error: {other}"),
    }
    let records = host.records.lock().unwrap();
    assert!(!records.last().unwrap().healthy);
}

#[tokio::test]
async fn test_cancelled_deployment() {
    let fixture = Fixture::new();
    let deployer = Deployer::new(fixture.config.clone());
    let host = Arc::new(FakeHost::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = deployer
        .ensure_agent_running(Arc::clone(&host), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::Cancelled));
    assert!(!deployer.is_deploying(&host.id));
}
