//! A reference-counted pool of local inference servers.
//!
//! Requests with the same [`ServerFingerprint`] share one server process. The
//! process itself is started by a [`ServerLauncher`], which lets tests swap in
//! fakes for `vllm serve`.
//!
//! Lock order: the registry lock may be taken before the broker's lock, never
//! the other way around, and neither is held across an `.await`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    async_utils::cancel::CancelSignal,
    prelude::*,
    resources::{
        broker::{Reservation, ResourceBroker},
        vllm,
    },
};

/// How long a server gets to shut down after SIGTERM before we kill it.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(15);

/// A request for a local server.
#[derive(Clone, Debug)]
pub struct ServerRequest {
    pub model: String,
    pub tensor_parallel_size: u32,
    pub data_parallel_size: u32,
    pub gpu_memory_utilization: f64,
    pub max_model_len: Option<u32>,
    pub extra_args: Vec<String>,
}

impl ServerRequest {
    /// How many GPUs this server needs.
    pub fn gpu_count(&self) -> usize {
        self.tensor_parallel_size as usize * self.data_parallel_size as usize
    }
}

/// A fully-normalized launch configuration, after model-specific
/// adjustments.
#[derive(Clone, Debug, PartialEq)]
pub struct LaunchPlan {
    pub model: String,
    pub tensor_parallel_size: u32,
    pub data_parallel_size: u32,
    pub gpu_memory_utilization: f64,
    pub max_model_len: Option<u32>,
    /// JSON for `--limit-mm-per-prompt`.
    pub mm_limit_per_prompt: String,
    pub extra_args: Vec<String>,
}

impl LaunchPlan {
    pub fn fingerprint(&self) -> ServerFingerprint {
        ServerFingerprint {
            model: self.model.clone(),
            tensor_parallel_size: self.tensor_parallel_size,
            data_parallel_size: self.data_parallel_size,
            gpu_memory_utilization_bits: self.gpu_memory_utilization.to_bits(),
            max_model_len: self.max_model_len,
            extra_args: self.extra_args.clone(),
        }
    }
}

/// Two requests with equal fingerprints can share a server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerFingerprint {
    pub model: String,
    pub tensor_parallel_size: u32,
    pub data_parallel_size: u32,
    /// `f64` isn't `Hash`, so we compare the exact bit pattern.
    pub gpu_memory_utilization_bits: u64,
    pub max_model_len: Option<u32>,
    pub extra_args: Vec<String>,
}

/// A running local server, shared by everybody who acquired it.
#[derive(Debug)]
pub struct ServerHandle {
    pub fingerprint: ServerFingerprint,
    pub model: String,
    pub base_url: String,
    pub port: u16,
    pub gpu_ids: Vec<usize>,
    pub log_path: PathBuf,
}

/// A child process serving a model.
#[async_trait]
pub trait ServerProcess: Send + Sync {
    /// Has the process exited on its own?
    fn has_exited(&mut self) -> bool;

    /// Ask the process to stop, and kill it if it hasn't stopped after `grace`.
    async fn terminate(&mut self, grace: Duration);
}

/// Starts server processes.
#[async_trait]
pub trait ServerLauncher: Send + Sync + 'static {
    /// Fail if local servers can't be launched at all on this machine.
    fn check_supported(&self) -> Result<()>;

    /// Model-specific checks, run before any resources are reserved.
    async fn preflight(&self, plan: &LaunchPlan) -> Result<()>;

    /// Start a server using `reservation`, and wait until it is ready to serve
    /// requests. On failure, any started process must already be stopped.
    async fn start(
        &self,
        plan: &LaunchPlan,
        reservation: &Reservation,
        log_path: &Path,
    ) -> Result<Box<dyn ServerProcess>>;
}

/// The base URL of a local server on `port`.
pub fn local_base_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}/v1")
}

struct PoolEntry {
    handle: Arc<ServerHandle>,
    process: Box<dyn ServerProcess>,
    reservation: Reservation,
    ref_count: usize,
}

/// Launches, shares and tears down local servers.
pub struct LocalServerPool {
    broker: Arc<ResourceBroker>,
    launcher: Arc<dyn ServerLauncher>,
    log_dir: PathBuf,
    servers: Mutex<HashMap<ServerFingerprint, PoolEntry>>,
    /// Serializes launches of the same fingerprint.
    launch_locks: Mutex<HashMap<ServerFingerprint, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalServerPool {
    pub fn new(
        broker: Arc<ResourceBroker>,
        launcher: Arc<dyn ServerLauncher>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            broker,
            launcher,
            log_dir: log_dir.into(),
            servers: Mutex::new(HashMap::new()),
            launch_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn broker(&self) -> &ResourceBroker {
        &self.broker
    }

    /// Fail unless local servers can run here.
    pub fn check_supported(&self) -> Result<()> {
        if self.broker.total_gpus() == 0 {
            bail!("No visible NVIDIA GPUs.");
        }
        self.launcher.check_supported()
    }

    /// Get a server for `request`, starting one if needed.
    #[instrument(level = "debug", skip_all, fields(model = %request.model))]
    pub async fn acquire(
        &self,
        request: &ServerRequest,
        cancel: &CancelSignal,
    ) -> Result<Arc<ServerHandle>> {
        self.check_supported()?;
        let required = request.gpu_count();
        let total = self.broker.total_gpus();
        if required > total {
            bail!(
                "Requested {} GPUs (tp={}, dp={}), but only {} GPUs are available",
                required,
                request.tensor_parallel_size,
                request.data_parallel_size,
                total,
            );
        }

        let plan = vllm::plan_launch(request);
        self.launcher.preflight(&plan).await?;
        let fingerprint = plan.fingerprint();

        let launch_lock = self.launch_lock(&fingerprint);
        let result = self
            .reuse_or_launch(&plan, &fingerprint, &launch_lock, required, cancel)
            .await;
        drop(launch_lock);
        if result.is_err() {
            self.prune_launch_lock(&fingerprint);
        }
        result
    }

    /// Hold the launch lock for `fingerprint` while we either reuse a live
    /// server or start a new one.
    async fn reuse_or_launch(
        &self,
        plan: &LaunchPlan,
        fingerprint: &ServerFingerprint,
        launch_lock: &tokio::sync::Mutex<()>,
        required: usize,
        cancel: &CancelSignal,
    ) -> Result<Arc<ServerHandle>> {
        let _launch_guard = tokio::select! {
            guard = launch_lock.lock() => guard,
            _ = cancel.canceled() => bail!("Canceled while waiting for GPUs"),
        };

        if let Some(handle) = self.reuse_existing(fingerprint).await {
            return Ok(handle);
        }

        let reservation = self.broker.acquire(required, cancel).await?;
        let log_path = self.log_path_for(reservation.port);
        if let Err(err) = std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Failed to create {:?}", self.log_dir))
        {
            self.broker.release(&reservation);
            return Err(err);
        }

        info!(
            model = %plan.model,
            gpu_ids = ?reservation.gpu_ids,
            port = reservation.port,
            log_path = %log_path.display(),
            "Starting local server"
        );
        let started = tokio::select! {
            result = self.launcher.start(plan, &reservation, &log_path) => result,
            _ = cancel.canceled() => Err(anyhow!("Canceled while starting local server")),
        };
        let process = match started {
            Ok(process) => process,
            Err(err) => {
                self.broker.release(&reservation);
                return Err(err);
            }
        };

        let handle = Arc::new(ServerHandle {
            fingerprint: fingerprint.clone(),
            model: plan.model.clone(),
            base_url: local_base_url(reservation.port),
            port: reservation.port,
            gpu_ids: reservation.gpu_ids.clone(),
            log_path,
        });
        info!(base_url = %handle.base_url, "Local server is ready");
        let mut servers = self.servers.lock().expect("lock poisoned");
        servers.insert(
            fingerprint.clone(),
            PoolEntry {
                handle: handle.clone(),
                process,
                reservation,
                ref_count: 1,
            },
        );
        Ok(handle)
    }

    /// Bump the ref count of a live server. Dead servers are evicted.
    async fn reuse_existing(&self, fingerprint: &ServerFingerprint) -> Option<Arc<ServerHandle>> {
        let dead = {
            let mut servers = self.servers.lock().expect("lock poisoned");
            let entry = servers.get_mut(fingerprint)?;
            if !entry.process.has_exited() {
                entry.ref_count += 1;
                debug!(ref_count = entry.ref_count, "Reusing local server");
                return Some(entry.handle.clone());
            }
            warn!(base_url = %entry.handle.base_url, "Local server exited unexpectedly; relaunching");
            servers.remove(fingerprint)?
        };
        self.stop_entry(dead).await;
        None
    }

    /// Drop one reference to `handle`, stopping the server when nobody is
    /// using it any more.
    pub async fn release(&self, handle: &Arc<ServerHandle>) {
        let entry = {
            let mut servers = self.servers.lock().expect("lock poisoned");
            let Some(entry) = servers.get_mut(&handle.fingerprint) else {
                return;
            };
            if !Arc::ptr_eq(&entry.handle, handle) {
                // Already replaced after an unexpected exit.
                return;
            }
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count > 0 {
                return;
            }
            match servers.remove(&handle.fingerprint) {
                Some(entry) => entry,
                None => return,
            }
        };
        info!(base_url = %handle.base_url, "Stopping local server");
        self.stop_entry(entry).await;
    }

    /// Stop every server, regardless of reference counts.
    pub async fn shutdown_all(&self) {
        let entries = {
            let mut servers = self.servers.lock().expect("lock poisoned");
            servers.drain().map(|(_, entry)| entry).collect::<Vec<_>>()
        };
        for entry in entries {
            info!(base_url = %entry.handle.base_url, "Shutting down local server");
            self.stop_entry(entry).await;
        }
    }

    /// Current reference count for `handle`, if it is still registered.
    pub fn ref_count(&self, handle: &Arc<ServerHandle>) -> Option<usize> {
        let servers = self.servers.lock().expect("lock poisoned");
        servers
            .get(&handle.fingerprint)
            .filter(|entry| Arc::ptr_eq(&entry.handle, handle))
            .map(|entry| entry.ref_count)
    }

    /// All registered servers.
    pub fn servers(&self) -> Vec<Arc<ServerHandle>> {
        let servers = self.servers.lock().expect("lock poisoned");
        servers.values().map(|entry| entry.handle.clone()).collect()
    }

    /// Terminate the process, then hand its GPUs back. Freeing the GPUs first
    /// would let a new server start while the old one still holds GPU memory.
    async fn stop_entry(&self, mut entry: PoolEntry) {
        entry.process.terminate(TERMINATE_GRACE).await;
        self.broker.release(&entry.reservation);
        self.prune_launch_lock(&entry.handle.fingerprint);
    }

    fn launch_lock(&self, fingerprint: &ServerFingerprint) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.launch_locks.lock().expect("lock poisoned");
        locks.entry(fingerprint.clone()).or_default().clone()
    }

    /// Forget the launch lock for `fingerprint` if nobody else holds it.
    fn prune_launch_lock(&self, fingerprint: &ServerFingerprint) {
        let mut locks = self.launch_locks.lock().expect("lock poisoned");
        if locks
            .get(fingerprint)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(fingerprint);
        }
    }

    fn log_path_for(&self, port: u16) -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        self.log_dir.join(format!("{timestamp}-{port}.log"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;

    /// A launcher that "starts" servers instantly, and counts them.
    #[derive(Default)]
    pub(crate) struct FakeLauncher {
        pub starts: AtomicUsize,
        pub terminations: Arc<AtomicUsize>,
        pub fail_start: AtomicBool,
        /// How long `start` takes, in milliseconds.
        pub start_delay_ms: AtomicU64,
        /// One exit flag per started process, in start order. Setting a flag
        /// makes that process look like it died.
        pub exited: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl FakeLauncher {
        /// Make the `n`th started process (counting from 0) exit.
        pub fn kill(&self, n: usize) {
            let exited = self.exited.lock().expect("lock poisoned");
            exited[n].store(true, Ordering::SeqCst);
        }
    }

    struct FakeProcess {
        terminations: Arc<AtomicUsize>,
        exited: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ServerProcess for FakeProcess {
        fn has_exited(&mut self) -> bool {
            self.exited.load(Ordering::SeqCst)
        }

        async fn terminate(&mut self, _grace: Duration) {
            self.exited.store(true, Ordering::SeqCst);
            self.terminations.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ServerLauncher for FakeLauncher {
        fn check_supported(&self) -> Result<()> {
            Ok(())
        }

        async fn preflight(&self, _plan: &LaunchPlan) -> Result<()> {
            Ok(())
        }

        async fn start(
            &self,
            _plan: &LaunchPlan,
            _reservation: &Reservation,
            _log_path: &Path,
        ) -> Result<Box<dyn ServerProcess>> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let delay = self.start_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail_start.load(Ordering::SeqCst) {
                bail!("vLLM server process exited before becoming ready");
            }
            let exited = Arc::new(AtomicBool::new(false));
            self.exited
                .lock()
                .expect("lock poisoned")
                .push(exited.clone());
            Ok(Box::new(FakeProcess {
                terminations: self.terminations.clone(),
                exited,
            }))
        }
    }

    pub(crate) fn request(model: &str, tp: u32, dp: u32) -> ServerRequest {
        ServerRequest {
            model: model.to_owned(),
            tensor_parallel_size: tp,
            data_parallel_size: dp,
            gpu_memory_utilization: 0.9,
            max_model_len: None,
            extra_args: vec![],
        }
    }

    fn pool_with(dir: &TempDir, total_gpus: usize, launcher: Arc<FakeLauncher>) -> LocalServerPool {
        let broker = Arc::new(ResourceBroker::new(total_gpus, 8, 0));
        LocalServerPool::new(broker, launcher, dir.path().join("vllm_logs"))
    }

    fn launch_lock_count(pool: &LocalServerPool) -> usize {
        pool.launch_locks.lock().expect("lock poisoned").len()
    }

    #[tokio::test]
    async fn identical_requests_share_one_server() -> Result<()> {
        let dir = TempDir::new()?;
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool_with(&dir, 1, launcher.clone());
        let cancel = CancelSignal::new();

        let mut req = request("org/model", 1, 1);
        req.extra_args = vec!["  --enforce-eager ".into(), "".into()];
        let first = pool.acquire(&req, &cancel).await?;
        req.extra_args = vec!["--enforce-eager".into(), "--enforce-eager".into()];
        let second = pool.acquire(&req, &cancel).await?;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(launcher.starts.load(Ordering::SeqCst), 1);
        assert_eq!(pool.ref_count(&first), Some(2));
        assert_eq!(pool.broker().allocated_gpus(), vec![0]);

        pool.release(&first).await;
        assert_eq!(pool.ref_count(&second), Some(1));
        assert_eq!(launcher.terminations.load(Ordering::SeqCst), 0);

        pool.release(&second).await;
        assert_eq!(pool.ref_count(&second), None);
        assert_eq!(launcher.terminations.load(Ordering::SeqCst), 1);
        assert!(pool.broker().allocated_gpus().is_empty());
        assert_eq!(pool.broker().active_servers(), 0);
        assert_eq!(launch_lock_count(&pool), 0);
        Ok(())
    }

    #[tokio::test]
    async fn oversubscription_fails_fast() -> Result<()> {
        let dir = TempDir::new()?;
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool_with(&dir, 2, launcher.clone());
        let err = pool
            .acquire(&request("org/model", 2, 2), &CancelSignal::new())
            .await
            .expect_err("4 GPUs on a 2-GPU host");
        assert_eq!(
            err.to_string(),
            "Requested 4 GPUs (tp=2, dp=2), but only 2 GPUs are available"
        );
        assert_eq!(launcher.starts.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn no_gpus_means_unsupported() -> Result<()> {
        let dir = TempDir::new()?;
        let pool = pool_with(&dir, 0, Arc::new(FakeLauncher::default()));
        let err = pool
            .acquire(&request("org/model", 1, 1), &CancelSignal::new())
            .await
            .expect_err("no GPUs");
        assert_eq!(err.to_string(), "No visible NVIDIA GPUs.");
        Ok(())
    }

    #[tokio::test]
    async fn failed_start_releases_resources() -> Result<()> {
        let dir = TempDir::new()?;
        let launcher = Arc::new(FakeLauncher::default());
        launcher.fail_start.store(true, Ordering::SeqCst);
        let pool = pool_with(&dir, 1, launcher.clone());
        let err = pool
            .acquire(&request("org/model", 1, 1), &CancelSignal::new())
            .await
            .expect_err("start fails");
        assert!(err.to_string().contains("exited before becoming ready"));
        assert!(pool.broker().allocated_gpus().is_empty());
        assert_eq!(pool.broker().active_servers(), 0);
        assert!(pool.servers().is_empty());
        assert_eq!(launch_lock_count(&pool), 0);
        Ok(())
    }

    #[tokio::test]
    async fn different_configs_get_different_servers() -> Result<()> {
        let dir = TempDir::new()?;
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool_with(&dir, 2, launcher.clone());
        let cancel = CancelSignal::new();
        let a = pool.acquire(&request("org/a", 1, 1), &cancel).await?;
        let b = pool.acquire(&request("org/b", 1, 1), &cancel).await?;
        assert_ne!(a.gpu_ids, b.gpu_ids);
        assert_eq!(launcher.starts.load(Ordering::SeqCst), 2);

        pool.shutdown_all().await;
        assert!(pool.servers().is_empty());
        assert!(pool.broker().allocated_gpus().is_empty());
        assert_eq!(launcher.terminations.load(Ordering::SeqCst), 2);
        assert_eq!(launch_lock_count(&pool), 0);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_acquirers_of_one_config_start_once() -> Result<()> {
        let dir = TempDir::new()?;
        let launcher = Arc::new(FakeLauncher::default());
        let pool = Arc::new(pool_with(&dir, 1, launcher.clone()));
        let mut tasks = vec![];
        for _ in 0..4 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.acquire(&request("org/model", 1, 1), &CancelSignal::new())
                    .await
            }));
        }
        let mut handles = vec![];
        for task in tasks {
            handles.push(task.await??);
        }
        assert_eq!(launcher.starts.load(Ordering::SeqCst), 1);
        assert_eq!(pool.ref_count(&handles[0]), Some(4));
        Ok(())
    }

    #[tokio::test]
    async fn dead_servers_are_replaced() -> Result<()> {
        let dir = TempDir::new()?;
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool_with(&dir, 1, launcher.clone());
        let cancel = CancelSignal::new();
        let req = request("org/model", 1, 1);

        let first = pool.acquire(&req, &cancel).await?;
        launcher.kill(0);
        let second = pool.acquire(&req, &cancel).await?;

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(launcher.starts.load(Ordering::SeqCst), 2);
        // The dead server was stopped and its GPU went to the new one.
        assert_eq!(launcher.terminations.load(Ordering::SeqCst), 1);
        assert_eq!(second.gpu_ids, vec![0]);
        assert_eq!(pool.broker().allocated_gpus(), vec![0]);
        assert_eq!(pool.broker().active_servers(), 1);
        assert_eq!(pool.ref_count(&second), Some(1));

        // Releasing the old handle doesn't touch its replacement.
        pool.release(&first).await;
        assert_eq!(pool.ref_count(&second), Some(1));
        assert_eq!(pool.broker().allocated_gpus(), vec![0]);

        pool.release(&second).await;
        assert!(pool.servers().is_empty());
        assert!(pool.broker().allocated_gpus().is_empty());
        assert_eq!(launch_lock_count(&pool), 0);
        Ok(())
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_gpus() -> Result<()> {
        let dir = TempDir::new()?;
        let launcher = Arc::new(FakeLauncher::default());
        let pool = Arc::new(pool_with(&dir, 1, launcher.clone()));
        let held = pool
            .acquire(&request("org/a", 1, 1), &CancelSignal::new())
            .await?;

        let cancel = CancelSignal::new();
        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(&request("org/b", 1, 1), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await??
            .expect_err("wait should be canceled");
        assert_eq!(err.to_string(), "Canceled while waiting for GPUs");
        assert_eq!(launcher.starts.load(Ordering::SeqCst), 1);
        assert_eq!(pool.broker().allocated_gpus(), vec![0]);
        assert_eq!(pool.broker().active_servers(), 1);
        assert_eq!(launch_lock_count(&pool), 1);

        pool.release(&held).await;
        assert!(pool.broker().allocated_gpus().is_empty());
        assert_eq!(pool.broker().active_servers(), 0);
        assert_eq!(launch_lock_count(&pool), 0);
        Ok(())
    }

    #[tokio::test]
    async fn cancel_while_starting_releases_resources() -> Result<()> {
        let dir = TempDir::new()?;
        let launcher = Arc::new(FakeLauncher::default());
        launcher.start_delay_ms.store(60_000, Ordering::SeqCst);
        let pool = Arc::new(pool_with(&dir, 1, launcher.clone()));

        let cancel = CancelSignal::new();
        let starter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(&request("org/model", 1, 1), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.starts.load(Ordering::SeqCst), 1);
        assert_eq!(pool.broker().allocated_gpus(), vec![0]);
        cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(5), starter)
            .await??
            .expect_err("start should be canceled");
        assert_eq!(err.to_string(), "Canceled while starting local server");
        assert!(pool.servers().is_empty());
        assert!(pool.broker().allocated_gpus().is_empty());
        assert_eq!(pool.broker().active_servers(), 0);
        assert_eq!(launch_lock_count(&pool), 0);
        Ok(())
    }
}
