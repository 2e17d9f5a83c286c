use std::path::PathBuf;
use std::time::Duration;

use crate::error::{QueueError, Result};

/// Timing and sizing knobs shared by the queue client, the worker pool and the reaper.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of concurrent build workers in one pool.
    pub worker_count: usize,
    /// Upper bound on one wait for a claimable job before the worker re-checks shutdown.
    pub poll_interval: Duration,
    /// How often a worker refreshes `heartbeat_at` for the job it owns.
    pub heartbeat_interval: Duration,
    /// Gap since the last heartbeat after which a job is presumed abandoned.
    pub stale_after: Duration,
    /// How often the reaper sweeps the active set.
    pub reaper_interval: Duration,
    /// Hard wall-clock budget for one build subprocess.
    pub max_runtime: Duration,
    /// Extra time a strategy gets beyond `max_runtime` for its own file work before
    /// the worker abandons it and kills its process groups.
    pub strategy_grace: Duration,
    /// Average build duration used for queue wait estimates.
    pub per_job_estimate: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(2),
            stale_after: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(5),
            max_runtime: Duration::from_secs(60),
            strategy_grace: Duration::from_secs(10),
            per_job_estimate: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, stale_after: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.stale_after = stale_after;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = max_runtime;
        self
    }

    pub fn with_strategy_grace(mut self, grace: Duration) -> Self {
        self.strategy_grace = grace;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Reject settings under which the reaper would fail healthy jobs or workers
    /// could never pick anything up.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(QueueError::InvalidConfig(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval >= self.stale_after {
            return Err(QueueError::InvalidConfig(format!(
                "heartbeat interval ({:?}) must be shorter than the staleness threshold ({:?})",
                self.heartbeat_interval, self.stale_after
            )));
        }
        if self.reaper_interval >= self.stale_after {
            return Err(QueueError::InvalidConfig(format!(
                "reaper interval ({:?}) must be shorter than the staleness threshold ({:?})",
                self.reaper_interval, self.stale_after
            )));
        }
        if self.max_runtime.is_zero() {
            return Err(QueueError::InvalidConfig(
                "max_runtime must be non-zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(QueueError::InvalidConfig(
                "poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// TI ARM clang toolchain used by the firmware compile strategy.
#[derive(Debug, Clone)]
pub struct CompileToolchain {
    /// Root of the ti-cgt-armllvm installation (contains `bin/tiarmclang`).
    pub compiler_root: PathBuf,
    /// Root of the MSPM0 SDK.
    pub sdk_root: PathBuf,
    /// Target device, e.g. `MSPM0G3507`. Also names the linker command file.
    pub device_name: String,
    /// Driverlib family directory under the SDK.
    pub device_family: String,
    /// Build tool invoked in the working directory.
    pub make_program: PathBuf,
    /// Directory holding one template sub-directory per lab.
    pub template_root: PathBuf,
}

impl Default for CompileToolchain {
    fn default() -> Self {
        Self {
            compiler_root: PathBuf::from("/opt/ti/ccs/tools/compiler/ti-cgt-armllvm_4.0.4.LTS"),
            sdk_root: PathBuf::from("/opt/ti/mspm0_sdk_2_09_00_01"),
            device_name: "MSPM0G3507".to_string(),
            device_family: "mspm0g1x0x_g3x0x".to_string(),
            make_program: PathBuf::from("make"),
            template_root: PathBuf::from("template_files"),
        }
    }
}

impl CompileToolchain {
    pub fn compiler(&self) -> PathBuf {
        self.compiler_root.join("bin").join("tiarmclang")
    }

    pub fn driverlib(&self) -> PathBuf {
        self.sdk_root
            .join("source/ti/driverlib/lib/ticlang/m0p")
            .join(&self.device_family)
            .join("driverlib.a")
    }

    /// Name of the linker command file the link step requires.
    pub fn linker_script_name(&self) -> String {
        format!("{}.cmd", self.device_name.to_lowercase())
    }
}

/// KiCad toolchain used by the design-rule-check strategy.
#[derive(Debug, Clone)]
pub struct DrcToolchain {
    pub kicad_cli: PathBuf,
    pub rsvg_convert: PathBuf,
    pub python: PathBuf,
    /// Script turning a DRC JSON report into HTML.
    pub report_script: PathBuf,
    pub preview_dpi: u32,
    pub make_program: PathBuf,
}

impl Default for DrcToolchain {
    fn default() -> Self {
        Self {
            kicad_cli: PathBuf::from("kicad-cli"),
            rsvg_convert: PathBuf::from("rsvg-convert"),
            python: PathBuf::from("python3"),
            report_script: PathBuf::from("drc_report_generator.py"),
            preview_dpi: 300,
            make_program: PathBuf::from("make"),
        }
    }
}
