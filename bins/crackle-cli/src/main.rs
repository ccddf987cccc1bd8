use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crackle_comm::{Communicator, SoloComm, TcpComm, TcpConfig};
use crackle_config::{load_from_path, AppCfg, Transport};
use crackle_core::{Executor, RunOutcome};
use crackle_device_api::{DevicePool, DeviceRuntime, DeviceType};
use crackle_device_cpu::{CpuDeviceSpec, CpuRuntime, KernelRegistry};
use crackle_md5::{register_kernels, Charset, CrackParams, Md5Crack};
use crackle_metrics::Metrics;
use crackle_utils::read_file;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crackle", version)]
struct Cli {
    /// Path to config TOML (optional)
    #[arg(short, long, default_value = "crackle.toml")]
    config: String,

    /// Log filter, e.g., info,debug,trace or crate=level
    #[arg(long)]
    log: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Search for the preimage of an MD5 sum
    Run(RunArgs),
    /// List the devices a run would use
    Devices,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// MD5 sum of the string to find, 32 hex digits
    #[arg(short = 'M', long)]
    md5: String,

    /// Known leading characters of the string
    #[arg(short, long, default_value = "")]
    prefix: String,

    /// alpha, digit, alnum, special or all
    #[arg(short = 'C', long, default_value_t = Charset::Alnum)]
    charset: Charset,

    /// Total string length, prefix included (1-8)
    #[arg(short = 'N', long, default_value_t = 8)]
    nchars: u8,

    /// Kernel manifest to build instead of the built-in one
    #[arg(short = 'f', long)]
    kernel_file: Option<PathBuf>,

    /// Maximum devices per system (0 = all)
    #[arg(short = 'm', long)]
    max_devices: Option<u32>,

    /// Use CPU devices only
    #[arg(short = 'c', long, conflicts_with = "gpu")]
    cpu: bool,

    /// Use GPU devices only
    #[arg(short = 'g', long)]
    gpu: bool,

    /// This process's rank; enables the TCP transport together with --world-size
    #[arg(long)]
    rank: Option<usize>,

    #[arg(long)]
    world_size: Option<usize>,

    /// host:port rank 0 listens on
    #[arg(long)]
    coordinator: Option<String>,
}

impl RunArgs {
    fn device_type(&self, cfg: &AppCfg) -> DeviceType {
        match (self.cpu, self.gpu) {
            (true, _) => DeviceType::Cpu,
            (_, true) => DeviceType::Gpu,
            _ => cfg.device.kind,
        }
    }

    /// Folds cluster flags into the loaded config.
    fn apply(&self, cfg: &mut AppCfg) {
        if let Some(rank) = self.rank {
            cfg.cluster.rank = rank;
        }
        if let Some(size) = self.world_size {
            cfg.cluster.world_size = size;
            if size > 1 {
                cfg.cluster.transport = Transport::Tcp;
            }
        }
        if let Some(addr) = &self.coordinator {
            cfg.cluster.coordinator = addr.clone();
        }
        if let Some(max) = self.max_devices {
            cfg.device.max_devices = max;
        }
    }

    fn params(&self, cfg: &AppCfg) -> Result<CrackParams> {
        let mut params = CrackParams::new(&self.md5)?;
        params.prefix = self.prefix.as_bytes().to_vec();
        params.charset = self.charset;
        params.nchars = self.nchars;
        params.device_type = self.device_type(cfg);
        params.max_devices = cfg.device.max_devices;
        if let Some(path) = &self.kernel_file {
            params.kernel_source = Some(read_file(path)?);
        }
        params.validate()?;
        Ok(params)
    }
}

fn host_runtime(cfg: &AppCfg) -> Arc<CpuRuntime> {
    let registry = KernelRegistry::new();
    register_kernels(&registry);
    let host = CpuDeviceSpec::host(cfg.device.lanes, Some(cfg.device.workgroup_size));
    Arc::new(CpuRuntime::with_devices(vec![host], registry))
}

async fn join_group(cfg: &AppCfg) -> Result<Arc<dyn Communicator>> {
    match cfg.cluster.transport {
        Transport::Solo => Ok(Arc::new(SoloComm::new())),
        Transport::Tcp => {
            let (backoff_min, backoff_max) = cfg.cluster.backoff()?;
            let tcp = TcpConfig {
                rank: cfg.cluster.rank,
                size: cfg.cluster.world_size,
                coordinator: cfg.cluster.coordinator.clone(),
                connect_attempts: cfg.cluster.connect_attempts,
                backoff_min,
                backoff_max,
            };
            let comm = TcpComm::connect(tcp)
                .await
                .with_context(|| format!("joining group at {}", cfg.cluster.coordinator))?;
            Ok(Arc::new(comm))
        }
    }
}

async fn run(mut cfg: AppCfg, args: RunArgs) -> Result<i32> {
    args.apply(&mut cfg);
    let params = args.params(&cfg)?;

    let metrics = match &cfg.runtime.telemetry_addr {
        Some(addr) => {
            let m = Arc::new(Metrics::new()?);
            let _server = m
                .serve(addr.parse().with_context(|| format!("telemetry address `{addr}`"))?)
                .await?;
            Some(m)
        }
        None => None,
    };
    let mut app = Md5Crack::new(params)?;
    if let Some(m) = metrics {
        app = app.with_metrics(m);
    }
    let app = Arc::new(app);
    app.dump();

    let comm = join_group(&cfg).await?;
    let runtime = host_runtime(&cfg);
    let started = Instant::now();
    let worker_app = app.clone();
    let (rank, outcome) = tokio::task::spawn_blocking(move || {
        let mut exec = Executor::new(comm, runtime);
        let outcome = exec.setup(worker_app).and_then(|_| {
            exec.dump();
            exec.run()
        });
        (exec.system_id(), outcome)
    })
    .await?;

    match outcome {
        Ok(outcome) => {
            if rank != 0 {
                info!(rank, ?outcome, "worker done");
                return Ok(0);
            }
            match app.found() {
                Some(m) => info!("Found match: {}", m.text()),
                None if outcome == RunOutcome::Completed => info!("Unable to find a match"),
                None => info!("Search stopped without a match"),
            }
            info!("Time taken for cracking: {:.3} seconds", started.elapsed().as_secs_f64());
            Ok(0)
        }
        Err(e) => {
            error!("Unable to crack MD5 sum. Error: {e}");
            Ok(e.code().abs())
        }
    }
}

fn list_devices(cfg: &AppCfg) -> Result<()> {
    let runtime: Arc<dyn DeviceRuntime> = host_runtime(cfg);
    let pool = DevicePool::init(runtime, cfg.device.kind, cfg.device.max_devices)?;
    for d in pool.devices() {
        println!(
            "{:>2}  {:<16} {:<11} {:>3} CU x {:<4} WG  capacity {:>6}  context {}",
            d.info.index,
            d.info.name,
            d.info.kind.to_string(),
            d.info.compute_units,
            d.info.workgroup_size,
            d.capacity(),
            d.info.context
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_from_path(&cli.config)?;
    let filter = cli
        .log
        .or_else(|| std::env::var("RUST_LOG").ok())
        .or_else(|| cfg.runtime.log.clone())
        .unwrap_or_else(|| "info".into());
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(filter)).init();

    match cli.cmd {
        Cmd::Run(args) => {
            let code = run(cfg, args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Cmd::Devices => list_devices(&cfg)?,
    }
    Ok(())
}
