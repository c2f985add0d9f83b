//! Host side of the worklet bridge.
//!
//! - [`WorkletClient`]: typed facade, one method per fixed slot.
//! - [`Worklet`]: a child worklet process wired to a client over its stdio.
//! - [`connect_in_process`]: the same pairing without a child process.
//! - [`install_client`] / [`client`]: process-wide accessor for UI code.
//! - [`Supervisor`]: restarts the worklet when it dies.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::context::WorkletContext;
use crate::methods;
use crate::rpc::{Method, Rpc, RpcError, Subscription};
use crate::services::crash::CrashReport;
use crate::services::network::NetworkStatus;
use crate::startup::StartupArgs;
use crate::transport::{Endpoint, IoTasks};

/// How long [`Worklet::shutdown`] waits for a clean exit before killing.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Typed client for the worklet's fixed slots.
#[derive(Debug, Clone)]
pub struct WorkletClient {
    rpc: Rpc,
    request_timeout: Option<Duration>,
}

impl WorkletClient {
    /// Client over an established multiplexer. No call deadline.
    pub fn new(rpc: Rpc) -> Self {
        Self {
            rpc,
            request_timeout: None,
        }
    }

    /// Bound every request by `timeout`.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Underlying multiplexer.
    pub fn rpc(&self) -> &Rpc {
        &self.rpc
    }

    async fn call<Resp: DeserializeOwned>(&self, method: Method<(), Resp>) -> Result<Resp, RpcError> {
        match self.request_timeout {
            Some(timeout) => self.rpc.request_with_timeout(method, &(), timeout).await,
            None => self.rpc.request(method, &()).await,
        }
    }

    /// Canonical public key of the worklet's backend.
    pub async fn identity(&self) -> Result<String, RpcError> {
        self.call(methods::IDENTITY).await
    }

    /// Start the inspector, or return the running session's key.
    pub async fn inspector_enable(&self) -> Result<String, RpcError> {
        self.call(methods::INSPECTOR_ENABLE).await
    }

    /// Stop the inspector.
    pub async fn inspector_disable(&self) -> Result<(), RpcError> {
        self.call(methods::INSPECTOR_DISABLE).await
    }

    /// Running inspector key, if any.
    pub async fn inspector_key(&self) -> Result<Option<String>, RpcError> {
        self.call(methods::INSPECTOR_KEY).await
    }

    /// Subscribe to network status snapshots.
    pub fn network_status(&self) -> Result<Subscription<NetworkStatus>, RpcError> {
        self.rpc.subscribe(methods::NETWORK_STATUS, &())
    }

    /// Subscribe to worklet crash reports.
    pub fn crash_reports(&self) -> Result<Subscription<CrashReport>, RpcError> {
        self.rpc.subscribe(methods::CRASH_RELAY, &())
    }

    /// True once the transport to the worklet is gone.
    pub fn is_closed(&self) -> bool {
        self.rpc.is_closed()
    }

    /// Wait until the transport to the worklet is gone.
    pub async fn closed(&self) {
        self.rpc.closed().await;
    }
}

/// Pair a client with an in-process worklet serving `ctx`.
///
/// Returns the client and the worklet-side multiplexer.
pub fn connect_in_process(ctx: &Arc<WorkletContext>) -> (WorkletClient, Rpc) {
    let (host_end, worklet_end) = Endpoint::pair();
    let server = crate::worklet::serve(worklet_end, ctx);
    (WorkletClient::new(Rpc::new(host_end)), server)
}

static CLIENT: RwLock<Option<WorkletClient>> = RwLock::new(None);

/// Publish `client` for the rest of the host. Returns the one it replaces.
pub fn install_client(client: WorkletClient) -> Option<WorkletClient> {
    CLIENT
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(client)
}

/// The published client, if a worklet is running.
pub fn client() -> Option<WorkletClient> {
    CLIENT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Withdraw the published client.
pub fn clear_client() -> Option<WorkletClient> {
    CLIENT.write().unwrap_or_else(PoisonError::into_inner).take()
}

/// How to launch a worklet process.
#[derive(Debug, Clone)]
pub struct WorkletCommand {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl WorkletCommand {
    /// Run `program`; startup arguments are appended after any [`arg`](Self::arg)s.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// This executable's `worklet` subcommand.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate current executable")?;
        Ok(Self::new(exe).arg("worklet"))
    }

    /// Append a fixed argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// A running worklet child process and its client.
#[derive(Debug)]
pub struct Worklet {
    child: Child,
    client: WorkletClient,
    io: IoTasks,
}

impl Worklet {
    /// Spawn the worklet with `args` and connect to it over its stdio.
    pub fn start(command: &WorkletCommand, args: &StartupArgs, request_timeout: Option<Duration>) -> Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .args(args.to_argv())
            .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worklet {}", command.program.display()))?;

        let stdin = child.stdin.take().context("Worklet stdin not piped")?;
        let stdout = child.stdout.take().context("Worklet stdout not piped")?;
        let (endpoint, io) = Endpoint::from_io(stdout, stdin);
        let client = WorkletClient::new(Rpc::new(endpoint)).with_request_timeout(request_timeout);

        log::info!(
            "[Host] Worklet started (pid: {:?}, storage: {}, mode: {})",
            child.id(),
            args.storage_path.display(),
            args.mode
        );

        Ok(Self { child, client, io })
    }

    /// Client connected to this worklet.
    pub fn client(&self) -> &WorkletClient {
        &self.client
    }

    /// Wait until the worklet answers a call, proving it is serving.
    pub async fn started(&self) -> Result<(), RpcError> {
        self.client.inspector_key().await.map(drop)
    }

    /// OS process id, while running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the worklet to exit. The client is closed afterwards.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await.context("Failed to wait for worklet")?;
        self.client.rpc().close();
        Ok(status)
    }

    /// Close the transport and wait for the worklet to exit, killing it
    /// after [`SHUTDOWN_GRACE`].
    pub async fn shutdown(mut self) -> Result<()> {
        // Dropping our end of stdin is the worklet's signal to exit.
        self.client.rpc().close();

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(status) => {
                log::info!("[Host] Worklet exited: {}", status?);
            }
            Err(_elapsed) => {
                log::warn!("[Host] Worklet did not exit within {SHUTDOWN_GRACE:?}, killing");
                self.child.kill().await.context("Failed to kill worklet")?;
            }
        }
        self.io.abort();
        Ok(())
    }
}

/// Restart policy for [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Restarts allowed before giving up.
    pub max_restarts: u32,
    /// Delay between an exit and the restart.
    pub restart_delay: Duration,
    /// Per-call deadline for published clients.
    pub request_timeout: Option<Duration>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_delay: Duration::from_millis(500),
            request_timeout: None,
        }
    }
}

/// Keeps one worklet running and its client published.
///
/// On worklet death the client is withdrawn, and a fresh worklet, transport
/// and multiplexer are started after the restart delay.
#[derive(Debug)]
pub struct Supervisor {
    command: WorkletCommand,
    args: StartupArgs,
    options: SupervisorOptions,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Supervise worklets launched with `command` and `args`.
    pub fn new(command: WorkletCommand, args: StartupArgs, options: SupervisorOptions) -> Self {
        Self {
            command,
            args,
            options,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the supervisor and shuts the worklet down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until cancelled or the restart budget is spent.
    ///
    /// Returns the number of restarts performed on clean shutdown.
    pub async fn run(self) -> Result<u32> {
        let mut restarts = 0;

        loop {
            let mut worklet = Worklet::start(&self.command, &self.args, self.options.request_timeout)?;

            let exit = tokio::select! {
                () = self.shutdown.cancelled() => None,
                status = Self::publish_until_exit(&mut worklet) => Some(status),
            };

            clear_client();
            let Some(status) = exit else {
                log::info!("[Supervisor] Shutting down worklet");
                worklet.shutdown().await?;
                return Ok(restarts);
            };

            let status = status?;
            if restarts >= self.options.max_restarts {
                bail!(
                    "Worklet exited ({status}) and the restart limit of {} was reached",
                    self.options.max_restarts
                );
            }
            restarts += 1;
            log::warn!(
                "[Supervisor] Worklet exited ({status}), restart {restarts}/{} in {:?}",
                self.options.max_restarts,
                self.options.restart_delay
            );

            tokio::select! {
                () = self.shutdown.cancelled() => return Ok(restarts),
                () = tokio::time::sleep(self.options.restart_delay) => {}
            }
        }
    }

    /// Publish the worklet's client once it answers, then wait for it to exit.
    async fn publish_until_exit(worklet: &mut Worklet) -> Result<ExitStatus> {
        match worklet.started().await {
            Ok(()) => {
                install_client(worklet.client().clone());
                log::info!("[Supervisor] Worklet {:?} serving, client published", worklet.id());
            }
            Err(e) => {
                log::warn!("[Supervisor] Worklet never answered: {e}");
                // Closing stdin makes a live worklet exit.
                worklet.client().rpc().close();
            }
        }
        worklet.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendOptions, LocalBackend};

    /// Serializes tests that touch the process-wide client slot.
    static ACCESSOR: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    #[tokio::test]
    async fn test_in_process_client_calls_every_slot() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path(), BackendOptions::default()));
        let ctx = Arc::new(WorkletContext::new(backend));
        let (client, _server) = connect_in_process(&ctx);

        let identity = client.identity().await.unwrap();
        assert_eq!(identity.len(), crate::id_encoding::Z32_LEN);

        assert_eq!(client.inspector_key().await.unwrap(), None);
        let key = client.inspector_enable().await.unwrap();
        assert_eq!(client.inspector_key().await.unwrap(), Some(key));
        client.inspector_disable().await.unwrap();
        assert_eq!(client.inspector_key().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_accessor_publishes_and_clears() {
        let _slot = ACCESSOR.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path(), BackendOptions::default()));
        let ctx = Arc::new(WorkletContext::new(backend));
        let (client, _server) = connect_in_process(&ctx);

        install_client(client);
        let published = super::client().unwrap();
        assert!(!published.is_closed());
        assert!(clear_client().is_some());
        assert!(super::client().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervisor_gives_up_after_restart_limit() {
        let _slot = ACCESSOR.lock().await;
        // Exits immediately; startup args land in $0 and $1.
        let command = WorkletCommand::new("sh").arg("-c").arg("exit 3");
        let options = SupervisorOptions {
            max_restarts: 2,
            restart_delay: Duration::from_millis(10),
            request_timeout: None,
        };
        let supervisor = Supervisor::new(command, StartupArgs::new("/tmp/keet", "keet"), options);

        let err = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
            .await
            .expect("supervisor hung")
            .unwrap_err();
        assert!(err.to_string().contains("restart limit of 2"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervisor_publishes_only_answering_worklet() {
        let _slot = ACCESSOR.lock().await;
        clear_client();
        // Alive but never replies.
        let command = WorkletCommand::new("sh").arg("-c").arg("cat >/dev/null");
        let supervisor = Supervisor::new(
            command,
            StartupArgs::new("/tmp/keet", "keet"),
            SupervisorOptions::default(),
        );
        let shutdown = supervisor.shutdown_token();
        let run = tokio::spawn(supervisor.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(super::client().is_none());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("supervisor hung")
            .unwrap()
            .unwrap();
        assert!(super::client().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervisor_shutdown_stops_worklet() {
        let _slot = ACCESSOR.lock().await;
        // Runs until its stdin closes.
        let command = WorkletCommand::new("sh").arg("-c").arg("cat >/dev/null");
        let supervisor = Supervisor::new(
            command,
            StartupArgs::new("/tmp/keet", "keet"),
            SupervisorOptions::default(),
        );
        let shutdown = supervisor.shutdown_token();
        let run = tokio::spawn(supervisor.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        let restarts = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("supervisor hung")
            .unwrap()
            .unwrap();
        assert_eq!(restarts, 0);
    }
}
