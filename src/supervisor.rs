use crate::config::BackendConfig;
use crate::error::SupervisorError;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Lifecycle of the supervised backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No launch has been attempted yet
    NotStarted,
    /// Process spawned, readiness probe in progress
    Starting,
    /// Readiness probe succeeded
    Healthy,
    /// Last start attempt timed out or failed to spawn
    StartFailed,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::NotStarted => "not_started",
            SupervisorState::Starting => "starting",
            SupervisorState::Healthy => "healthy",
            SupervisorState::StartFailed => "start_failed",
        }
    }
}

/// Which child pipe a drain task reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// The running child process
struct BackendProcess {
    child: Child,
    pid: Option<u32>,
    spawned_at: Instant,
}

impl BackendProcess {
    /// Non-blocking exit poll; `None` while the process is still running
    fn exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                // Assume alive: respawning on a poll error could leave two children
                warn!(pid = self.pid, error = %e, "Failed to poll backend process status");
                None
            }
        }
    }
}

/// Owns the single backend child process.
///
/// `Supervisor` is shared behind an `Arc` between the gateway and the binary.
/// The check-then-spawn sequence runs under an async mutex so concurrent
/// callers never launch a second child; callers that queued behind a start
/// attempt return that attempt's outcome instead of starting their own.
pub struct Supervisor {
    config: BackendConfig,
    health_url: String,
    /// Current child process, if any
    process: Mutex<Option<BackendProcess>>,
    /// Serializes start attempts
    start_lock: tokio::sync::Mutex<()>,
    state: Mutex<SupervisorState>,
    /// A launch has been attempted
    started: AtomicBool,
    /// The readiness probe has succeeded for the current process
    ready: AtomicBool,
    /// Completed start attempts
    attempts: AtomicU64,
    /// Child processes launched
    spawns: AtomicU64,
    probe_client: Client<HttpConnector, Empty<Bytes>>,
}

impl Supervisor {
    /// Create a supervisor. Nothing is spawned until [`ensure_started`](Self::ensure_started).
    pub fn new(config: BackendConfig) -> Arc<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let probe_client = Client::builder(TokioExecutor::new()).build(connector);

        Arc::new(Self {
            health_url: config.health_url(),
            config,
            process: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(SupervisorState::NotStarted),
            started: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
            spawns: AtomicU64::new(0),
            probe_client,
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Port the backend listens on
    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Base URL of the backend on the loopback interface
    pub fn base_url(&self) -> String {
        self.config.base_url()
    }

    /// Whether the readiness probe has succeeded. Pure read.
    pub fn is_healthy(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Whether a launch has ever been attempted
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    /// Number of child processes launched so far
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::SeqCst)
    }

    /// PID of the current child process, if one is held
    pub fn pid(&self) -> Option<u32> {
        self.process.lock().as_ref().and_then(|p| p.pid)
    }

    fn set_state(&self, state: SupervisorState) {
        let mut guard = self.state.lock();
        if *guard != state {
            debug!(from = guard.as_str(), to = state.as_str(), "Supervisor state changed");
            *guard = state;
        }
    }

    /// Healthy flag set and the child still running
    fn is_serving(&self) -> bool {
        if !self.ready.load(Ordering::SeqCst) {
            return false;
        }
        self.process
            .lock()
            .as_mut()
            .is_some_and(|p| p.exit_status().is_none())
    }

    /// Make sure a healthy backend is running.
    ///
    /// Returns `Ok(true)` once the backend answered its health endpoint with
    /// 200, `Ok(false)` if it did not within the configured attempts, and
    /// `Err` only when the executable could not be launched.
    pub async fn ensure_started(&self) -> Result<bool, SupervisorError> {
        if self.is_serving() {
            return Ok(true);
        }

        let seen = self.attempts.load(Ordering::SeqCst);
        let _guard = self.start_lock.lock().await;

        if self.attempts.load(Ordering::SeqCst) != seen {
            // Another caller ran a start attempt while we waited for the lock
            return Ok(self.is_serving());
        }

        let outcome = self.start_locked().await;
        self.attempts.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    /// Body of a start attempt. Caller must hold `start_lock`.
    async fn start_locked(&self) -> Result<bool, SupervisorError> {
        let needs_spawn = {
            let mut slot = self.process.lock();
            match slot.as_mut() {
                Some(process) => match process.exit_status() {
                    None => false,
                    Some(status) => {
                        warn!(
                            pid = process.pid,
                            %status,
                            uptime_ms = process.spawned_at.elapsed().as_millis() as u64,
                            "Backend process exited"
                        );
                        *slot = None;
                        true
                    }
                },
                None => true,
            }
        };

        if !needs_spawn && self.ready.load(Ordering::SeqCst) {
            return Ok(true);
        }

        if needs_spawn {
            if self.ready.swap(false, Ordering::SeqCst) {
                info!("Restarting backend after it exited");
            }
            self.set_state(SupervisorState::Starting);
            self.started.store(true, Ordering::SeqCst);

            let process = match self.spawn() {
                Ok(process) => process,
                Err(e) => {
                    self.set_state(SupervisorState::StartFailed);
                    return Err(e);
                }
            };
            *self.process.lock() = Some(process);
        } else {
            self.set_state(SupervisorState::Starting);
        }

        if self.wait_until_healthy().await {
            self.ready.store(true, Ordering::SeqCst);
            self.set_state(SupervisorState::Healthy);
            return Ok(true);
        }

        error!(
            attempts = self.config.health_check_attempts,
            health_url = %self.health_url,
            "Backend failed to become healthy within timeout"
        );
        self.terminate_current().await;
        self.set_state(SupervisorState::StartFailed);
        Ok(false)
    }

    /// Launch the child and detach its output drain tasks
    fn spawn(&self) -> Result<BackendProcess, SupervisorError> {
        let config = &self.config;
        info!(
            command = %config.command,
            args = ?config.args,
            port = config.port,
            "Starting backend process"
        );

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = config.working_dir {
            cmd.current_dir(working_dir);
        }

        cmd.envs(&config.env);
        cmd.env(&config.port_env, config.port.to_string());

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            command: config.command.clone(),
            source,
        })?;
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let pid = child.id();
        info!(pid, "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_output(stdout, pid, OutputStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_output(stderr, pid, OutputStream::Stderr));
        }

        Ok(BackendProcess {
            child,
            pid,
            spawned_at: Instant::now(),
        })
    }

    /// Poll the health endpoint at a fixed rate up to the attempt ceiling.
    /// A slow probe eats into the interval rather than adding to it.
    async fn wait_until_healthy(&self) -> bool {
        let attempts = self.config.health_check_attempts;
        let interval = self
            .config
            .health_check_interval()
            .max(Duration::from_millis(1));

        debug!(health_url = %self.health_url, attempts, "Waiting for backend to become ready");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for attempt in 1..=attempts {
            ticker.tick().await;

            if self.probe().await {
                info!(attempt, "Backend is ready");
                return true;
            }

            let exited = self
                .process
                .lock()
                .as_mut()
                .and_then(|p| p.exit_status());
            if let Some(status) = exited {
                error!(%status, attempt, "Backend process exited during startup");
                return false;
            }
        }

        false
    }

    /// Single readiness probe. Connection errors and timeouts mean "not yet".
    async fn probe(&self) -> bool {
        let req = match Request::builder()
            .method(Method::GET)
            .uri(&self.health_url)
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        let timeout = self.config.health_check_timeout();
        match tokio::time::timeout(timeout, self.probe_client.request(req)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                if status != StatusCode::OK {
                    debug!(%status, "Health check returned non-200");
                }
                status == StatusCode::OK
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Health check failed");
                false
            }
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "Health check timed out");
                false
            }
        }
    }

    /// Stop the backend gracefully (used at proxy shutdown)
    pub async fn stop(&self) {
        self.terminate_current().await;
        self.set_state(SupervisorState::NotStarted);
    }

    async fn terminate_current(&self) {
        let process = self.process.lock().take();
        self.ready.store(false, Ordering::SeqCst);

        if let Some(mut process) = process {
            self.terminate(&mut process).await;
        }
    }

    /// SIGTERM, wait for the grace period, then SIGKILL
    async fn terminate(&self, process: &mut BackendProcess) {
        let grace_period = self.config.shutdown_grace_period();

        if process.exit_status().is_some() {
            debug!(pid = process.pid, "Backend process already exited");
            return;
        }

        if let Some(pid) = process.pid {
            info!(pid, "Sending SIGTERM to backend");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = process.child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, process.child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = process.pid, %status, "Backend process exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(pid = process.pid, error = %e, "Error waiting for backend to exit");
            }
            Err(_) => {
                warn!(
                    pid = process.pid,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = process.child.kill().await;
            }
        }
    }
}

/// Log every line of a child output stream until end-of-stream.
///
/// Returns the number of lines forwarded. Invalid UTF-8 is replaced rather
/// than ending the drain, so a full pipe can never stall the child.
pub async fn drain_output<R>(reader: R, pid: Option<u32>, stream: OutputStream) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut lines = 0;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end();
                if line.is_empty() {
                    continue;
                }
                lines += 1;
                match stream {
                    OutputStream::Stdout => {
                        info!(target: "backend", pid, stream = stream.as_str(), "{}", line)
                    }
                    OutputStream::Stderr => {
                        error!(target: "backend", pid, stream = stream.as_str(), "{}", line)
                    }
                }
            }
            Err(e) => {
                debug!(pid, stream = stream.as_str(), error = %e, "Backend output read failed");
                break;
            }
        }
    }

    debug!(pid, stream = stream.as_str(), lines, "Backend output stream closed");
    lines
}
