//! Launching `vllm serve` as a child process.

use std::{
    collections::HashSet,
    process::Stdio,
    sync::LazyLock,
    time::{Duration, Instant},
};

use regex::Regex;
use tokio::process::{Child, Command};

use crate::{
    async_utils::find_in_path,
    prelude::*,
    resources::{
        broker::Reservation,
        pool::{LaunchPlan, ServerLauncher, ServerProcess, ServerRequest, local_base_url},
    },
};

/// The GLM-OCR model, which needs special handling.
const GLM_OCR_MODEL: &str = "zai-org/glm-ocr";

/// How to upgrade vLLM and transformers for GLM-OCR.
const GLM_OCR_UPGRADE_STEPS: &str = "  uv pip install -U --pre vllm --extra-index-url https://wheels.vllm.ai/nightly\n  uv pip install -U git+https://github.com/huggingface/transformers.git";

/// How many log lines to include in startup errors.
const LOG_TAIL_LINES: usize = 40;

/// ANSI escape sequences, which vLLM uses for colored logs.
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("failed to compile regex")
});

/// Is this the GLM-OCR model?
pub fn is_glm_ocr(model: &str) -> bool {
    model.trim().eq_ignore_ascii_case(GLM_OCR_MODEL)
}

/// Trim and drop empty arguments, then drop repeated options. An option is a
/// token starting with `-` plus any values that follow it, so values shared by
/// different options are never merged.
pub fn normalize_extra_args(args: &[String]) -> Vec<String> {
    let tokens = args
        .iter()
        .map(|arg| arg.trim())
        .filter(|arg| !arg.is_empty())
        .map(str::to_owned);

    let mut groups: Vec<Vec<String>> = vec![];
    for token in tokens {
        match groups.last_mut() {
            Some(group) if !token.starts_with('-') => group.push(token),
            _ => groups.push(vec![token]),
        }
    }

    let mut seen = HashSet::new();
    groups
        .into_iter()
        .filter(|group| seen.insert(group.clone()))
        .flatten()
        .collect()
}

/// Apply model-specific adjustments and normalize a request.
pub fn plan_launch(request: &ServerRequest) -> LaunchPlan {
    let model = request.model.trim().to_owned();
    let mut extra_args = normalize_extra_args(&request.extra_args);
    let mm_limit_per_prompt = if is_glm_ocr(&model) {
        if !extra_args.iter().any(|arg| arg == "--allowed-local-media-path") {
            extra_args.extend(["--allowed-local-media-path".to_owned(), "/".to_owned()]);
        }
        r#"{"image": 1}"#
    } else {
        r#"{"video": 0}"#
    };
    LaunchPlan {
        model,
        tensor_parallel_size: request.tensor_parallel_size,
        data_parallel_size: request.data_parallel_size,
        gpu_memory_utilization: request.gpu_memory_utilization,
        max_model_len: request.max_model_len,
        mm_limit_per_prompt: mm_limit_per_prompt.to_owned(),
        extra_args,
    }
}

/// Arguments for `vllm`, starting with `serve`.
pub fn serve_args(plan: &LaunchPlan, port: u16) -> Vec<String> {
    let mut args = vec![
        "serve".to_owned(),
        plan.model.clone(),
        "--served-model-name".to_owned(),
        plan.model.clone(),
        "--port".to_owned(),
        port.to_string(),
        "--uvicorn-log-level".to_owned(),
        "warning".to_owned(),
        "--tensor-parallel-size".to_owned(),
        plan.tensor_parallel_size.to_string(),
        "--data-parallel-size".to_owned(),
        plan.data_parallel_size.to_string(),
        "--limit-mm-per-prompt".to_owned(),
        plan.mm_limit_per_prompt.clone(),
        "--gpu-memory-utilization".to_owned(),
        plan.gpu_memory_utilization.to_string(),
        "--trust-remote-code".to_owned(),
    ];
    if let Some(max_model_len) = plan.max_model_len {
        args.extend(["--max-model-len".to_owned(), max_model_len.to_string()]);
    }
    args.extend(plan.extra_args.iter().cloned());
    args
}

/// Leading major version number, like `5` for `5.0.0.dev0`.
pub fn parse_major_version(version: &str) -> Option<u32> {
    let digits = version
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>();
    digits.parse().ok()
}

/// GLM-OCR needs transformers 5 or newer. Unknown versions are allowed.
pub fn check_transformers_version(model: &str, version: Option<&str>) -> Result<()> {
    if !is_glm_ocr(model) {
        return Ok(());
    }
    let Some(version) = version else {
        return Ok(());
    };
    match parse_major_version(version) {
        Some(major) if major < 5 => bail!(
            "zai-org/GLM-OCR requires newer transformers support for `glm_ocr` (detected transformers=={}). Upgrade as documented by the model page, e.g.:\n{}",
            version.trim(),
            GLM_OCR_UPGRADE_STEPS,
        ),
        _ => Ok(()),
    }
}

/// The last `max_lines` lines of a log file, with ANSI escapes removed.
pub fn tail_log_lines(path: &Path, max_lines: usize) -> String {
    let Ok(bytes) = std::fs::read(path) else {
        return String::new();
    };
    let content = String::from_utf8_lossy(&bytes);
    let content = ANSI_ESCAPE.replace_all(&content, "");
    let lines = content.lines().collect::<Vec<_>>();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Build a startup error message with enough context to debug it.
pub fn startup_failure_detail(err: &anyhow::Error, log_path: &Path, model: &str) -> String {
    let recent_logs = tail_log_lines(log_path, LOG_TAIL_LINES);
    let mut detail = format!("{err}. vLLM log: {}", log_path.display());
    if is_glm_ocr(model) && recent_logs.contains("does not recognize this architecture") {
        detail.push_str("\nHint: GLM-OCR needs newer transformers support (`glm_ocr`). Try:\n");
        detail.push_str(GLM_OCR_UPGRADE_STEPS);
    }
    if !recent_logs.is_empty() {
        detail.push_str("\nRecent log lines:\n");
        detail.push_str(&recent_logs);
    }
    detail
}

/// Starts real `vllm serve` processes.
#[derive(Clone, Debug)]
pub struct VllmLauncher {
    executable: PathBuf,
    ready_timeout: Duration,
    poll_interval: Duration,
    client: reqwest::Client,
}

impl VllmLauncher {
    pub fn new(ready_timeout: Duration) -> Self {
        Self {
            executable: PathBuf::from("vllm"),
            ready_timeout,
            poll_interval: Duration::from_secs(2),
            client: reqwest::Client::new(),
        }
    }

    /// Use a different executable in place of `vllm`.
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    /// Override how often we probe for readiness.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn resolved_executable(&self) -> Option<PathBuf> {
        if self.executable.components().count() > 1 {
            self.executable.is_file().then(|| self.executable.clone())
        } else {
            find_in_path(&self.executable.to_string_lossy())
        }
    }

    /// Ask vLLM's Python interpreter which `transformers` it has.
    async fn transformers_version(&self) -> Option<String> {
        let python = self
            .resolved_executable()
            .and_then(|path| shebang_interpreter(&path))
            .unwrap_or_else(|| PathBuf::from("python3"));
        let output = Command::new(&python)
            .args([
                "-c",
                "import importlib.metadata as m; print(m.version('transformers'))",
            ])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        (!version.is_empty()).then_some(version)
    }
}

/// The interpreter named by a script's `#!` line, if it's a plain path.
fn shebang_interpreter(script: &Path) -> Option<PathBuf> {
    let bytes = std::fs::read(script).ok()?;
    let first_line = bytes.split(|b| *b == b'\n').next()?;
    let line = std::str::from_utf8(first_line).ok()?;
    let interpreter = line.strip_prefix("#!")?.split_whitespace().next()?;
    let path = PathBuf::from(interpreter);
    (path.file_name()? != "env").then_some(path)
}

#[async_trait]
impl ServerLauncher for VllmLauncher {
    fn check_supported(&self) -> Result<()> {
        if self.resolved_executable().is_none() {
            bail!("vLLM CLI executable not found in PATH. Install vllm to use local models.");
        }
        Ok(())
    }

    async fn preflight(&self, plan: &LaunchPlan) -> Result<()> {
        if !is_glm_ocr(&plan.model) {
            return Ok(());
        }
        let version = self.transformers_version().await;
        debug!(?version, "Detected transformers version");
        check_transformers_version(&plan.model, version.as_deref())
    }

    #[instrument(level = "debug", skip_all, fields(model = %plan.model, port = reservation.port))]
    async fn start(
        &self,
        plan: &LaunchPlan,
        reservation: &Reservation,
        log_path: &Path,
    ) -> Result<Box<dyn ServerProcess>> {
        let log_file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create vLLM log {:?}", log_path))?;
        let stderr_file = log_file
            .try_clone()
            .with_context(|| format!("Failed to open vLLM log {:?}", log_path))?;
        let gpu_list = reservation
            .gpu_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let child = Command::new(&self.executable)
            .args(serve_args(plan, reservation.port))
            .env("CUDA_VISIBLE_DEVICES", gpu_list)
            .env("OMP_NUM_THREADS", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {:?}", self.executable))?;

        let mut process = VllmProcess::new(child);
        let base_url = local_base_url(reservation.port);
        let ready = process
            .wait_ready(&self.client, &base_url, self.ready_timeout, self.poll_interval)
            .await;
        if let Err(err) = ready {
            process.terminate(Duration::from_secs(5)).await;
            bail!(startup_failure_detail(&err, log_path, &plan.model));
        }
        Ok(Box::new(process))
    }
}

/// A running `vllm serve` process.
#[derive(Debug)]
pub struct VllmProcess {
    child: Child,
}

impl VllmProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }

    /// Poll `<base_url>/models` until it answers, the process dies, or we
    /// run out of time.
    pub async fn wait_ready(
        &mut self,
        client: &reqwest::Client,
        base_url: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let probe_url = format!("{base_url}/models");
        while Instant::now() < deadline {
            if self.has_exited() {
                bail!("vLLM server process exited before becoming ready");
            }
            let probe = client
                .get(&probe_url)
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            match probe {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => trace!(status = %response.status(), "Server not ready yet"),
                Err(err) => trace!(%err, "Server not ready yet"),
            }
            tokio::time::sleep(poll_interval).await;
        }
        bail!("Timed out waiting for vLLM server at {}", probe_url)
    }
}

#[async_trait]
impl ServerProcess for VllmProcess {
    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self, grace: Duration) {
        if self.has_exited() {
            return;
        }
        if let Some(pid) = self.child.id() {
            // Let vLLM shut down its workers cleanly.
            let sent = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await;
            if let Err(err) = sent {
                warn!(pid, %err, "Could not send SIGTERM");
            }
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Server exited"),
            Ok(Err(err)) => warn!(%err, "Could not wait for server"),
            Err(_) => {
                warn!("Server ignored SIGTERM; killing it");
                if let Err(err) = self.child.kill().await {
                    warn!(%err, "Could not kill server");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::resources::pool::tests::request;

    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| (*arg).to_owned()).collect()
    }

    #[test]
    fn normalizes_extra_args_by_option() {
        let args = strings(&[
            " --max-num-seqs",
            "8",
            "",
            "--enforce-eager",
            "--max-num-seqs",
            "8",
            "--block-size",
            "8",
            "--enforce-eager ",
        ]);
        assert_eq!(
            normalize_extra_args(&args),
            strings(&["--max-num-seqs", "8", "--enforce-eager", "--block-size", "8"])
        );
    }

    #[test]
    fn builds_serve_args() {
        let mut req = request("lightonai/LightOnOCR-2-1B", 2, 1);
        req.max_model_len = Some(8192);
        req.extra_args = strings(&["--enforce-eager"]);
        let plan = plan_launch(&req);
        let args = serve_args(&plan, 9001);
        assert_eq!(
            args,
            strings(&[
                "serve",
                "lightonai/LightOnOCR-2-1B",
                "--served-model-name",
                "lightonai/LightOnOCR-2-1B",
                "--port",
                "9001",
                "--uvicorn-log-level",
                "warning",
                "--tensor-parallel-size",
                "2",
                "--data-parallel-size",
                "1",
                "--limit-mm-per-prompt",
                r#"{"video": 0}"#,
                "--gpu-memory-utilization",
                "0.9",
                "--trust-remote-code",
                "--max-model-len",
                "8192",
                "--enforce-eager",
            ])
        );
    }

    #[test]
    fn glm_ocr_gets_image_limit_and_media_path() {
        let plan = plan_launch(&request(" ZAI-org/GLM-OCR ", 1, 1));
        assert_eq!(plan.mm_limit_per_prompt, r#"{"image": 1}"#);
        assert_eq!(
            plan.extra_args,
            strings(&["--allowed-local-media-path", "/"])
        );

        let mut req = request("zai-org/GLM-OCR", 1, 1);
        req.extra_args = strings(&["--allowed-local-media-path", "/data"]);
        assert_eq!(
            plan_launch(&req).extra_args,
            strings(&["--allowed-local-media-path", "/data"])
        );
    }

    #[test]
    fn glm_ocr_requires_transformers_5() {
        let err = check_transformers_version("zai-org/GLM-OCR", Some("4.57.1"))
            .expect_err("too old");
        assert!(err.to_string().contains("transformers==4.57.1"));
        assert!(err.to_string().contains("uv pip install -U --pre vllm"));
        assert!(check_transformers_version("zai-org/GLM-OCR", Some("5.0.0.dev0")).is_ok());
        assert!(check_transformers_version("zai-org/GLM-OCR", None).is_ok());
        assert!(check_transformers_version("other/model", Some("4.0")).is_ok());
    }

    #[test]
    fn failure_detail_includes_clean_log_tail_and_hint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log_path = dir.path().join("1-9000.log");
        let mut log = String::new();
        for i in 0..50 {
            log.push_str(&format!("line {i}\n"));
        }
        log.push_str("\x1b[1;31mERROR\x1b[0m Transformers does not recognize this architecture\n");
        std::fs::write(&log_path, log)?;

        let err = anyhow!("vLLM server process exited before becoming ready");
        let detail = startup_failure_detail(&err, &log_path, "zai-org/GLM-OCR");
        assert!(detail.starts_with("vLLM server process exited before becoming ready. vLLM log: "));
        assert!(detail.contains("Hint: GLM-OCR needs newer transformers"));
        assert!(detail.contains("ERROR Transformers does not recognize"));
        assert!(!detail.contains('\x1b'));
        assert!(!detail.contains("line 10\n"));
        assert!(detail.contains("line 11\n"));

        let plain = startup_failure_detail(&err, &log_path, "other/model");
        assert!(!plain.contains("Hint:"));
        Ok(())
    }

    #[test]
    fn reads_shebang_interpreter() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let script = dir.path().join("vllm");
        std::fs::write(&script, "#!/opt/venv/bin/python3\nprint('hi')\n")?;
        assert_eq!(
            shebang_interpreter(&script),
            Some(PathBuf::from("/opt/venv/bin/python3"))
        );
        std::fs::write(&script, "#!/usr/bin/env python3\n")?;
        assert_eq!(shebang_interpreter(&script), None);
        Ok(())
    }

    #[tokio::test]
    async fn early_exit_is_reported() -> Result<()> {
        let child = Command::new("sh").args(["-c", "exit 1"]).spawn()?;
        let mut process = VllmProcess::new(child);
        let err = process
            .wait_ready(
                &reqwest::Client::new(),
                "http://127.0.0.1:1/v1",
                Duration::from_secs(30),
                Duration::from_millis(50),
            )
            .await
            .expect_err("process exits");
        assert_eq!(
            err.to_string(),
            "vLLM server process exited before becoming ready"
        );
        Ok(())
    }

    #[tokio::test]
    async fn terminate_stops_running_process() -> Result<()> {
        let child = Command::new("sleep").arg("30").spawn()?;
        let mut process = VllmProcess::new(child);
        assert!(!process.has_exited());
        tokio::time::timeout(Duration::from_secs(10), process.terminate(Duration::from_secs(5)))
            .await?;
        assert!(process.has_exited());
        Ok(())
    }

    #[tokio::test]
    async fn launcher_reports_startup_failure_with_log() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log_path = dir.path().join("start.log");
        // `sh serve ...` fails immediately, because there's no script named
        // `serve`.
        let launcher = VllmLauncher::new(Duration::from_secs(30))
            .with_executable("sh")
            .with_poll_interval(Duration::from_millis(50));
        let plan = plan_launch(&request("org/model", 1, 1));
        let reservation = Reservation {
            gpu_ids: vec![0],
            port: 1,
        };
        let err = match launcher.start(&plan, &reservation, &log_path).await {
            Ok(_) => panic!("start should fail"),
            Err(err) => err.to_string(),
        };
        assert!(err.contains("exited before becoming ready"), "{err}");
        assert!(err.contains(&log_path.display().to_string()), "{err}");
        assert!(err.contains("Recent log lines:"), "{err}");
        Ok(())
    }
}
