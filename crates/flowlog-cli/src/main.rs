mod generator;

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use flowlog_core::{CollectorConfig, Controller};
use flowlog_types::Cx;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::generator::Generator;

#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    config: Option<PathBuf>,
    threshold: Option<usize>,
    store: Option<PathBuf>,
    spill: Option<PathBuf>,
    max_size_mb: Option<u64>,
    batch_size: Option<usize>,
    interval_ms: Option<u64>,
    duration_secs: Option<u64>,
    log_file: Option<PathBuf>,
    seed: Option<u64>,
}

fn print_help() {
    let help = "\
flowlogd - buffer synthetic flow records into SQLite with spill-file fallback

USAGE:
    flowlogd [OPTIONS]

OPTIONS:
    --config <PATH>         TOML configuration file
    --threshold <N>         Buffered records that trigger a flush (default: 10000)
    --store <PATH>          SQLite store path (default: ./logs.db)
    --spill <PATH>          Spill file path (default: ./cache_temp.dat)
    --max-size-mb <N>       Rotate the store at this size (default: 100)
    --batch-size <N>        Records generated per step (default: 10)
    --interval-ms <N>       Delay between steps (default: 100)
    --duration-secs <N>     Stop after N seconds (default: run until signalled)
    --log-file <PATH>       Append logs to PATH instead of stderr
    --seed <u64>            Seed the record generator
    -h, --help              Show this help

Flags override values from --config. RUST_LOG overrides the log filter.
";
    println!("{help}");
}

fn flag_value<'a>(args: &'a [String], index: &mut usize, flag: &str) -> Result<&'a str, String> {
    *index += 1;
    args.get(*index)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_number<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T, String> {
    value
        .parse::<T>()
        .map_err(|_| format!("invalid {flag} value: {value}"))
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut cli = CliArgs::default();
    let mut index = 0;
    while index < args.len() {
        let flag = args[index].as_str();
        match flag {
            "--config" => cli.config = Some(flag_value(args, &mut index, flag)?.into()),
            "--threshold" => {
                cli.threshold = Some(parse_number(flag_value(args, &mut index, flag)?, flag)?);
            }
            "--store" => cli.store = Some(flag_value(args, &mut index, flag)?.into()),
            "--spill" => cli.spill = Some(flag_value(args, &mut index, flag)?.into()),
            "--max-size-mb" => {
                cli.max_size_mb = Some(parse_number(flag_value(args, &mut index, flag)?, flag)?);
            }
            "--batch-size" => {
                cli.batch_size = Some(parse_number(flag_value(args, &mut index, flag)?, flag)?);
            }
            "--interval-ms" => {
                cli.interval_ms = Some(parse_number(flag_value(args, &mut index, flag)?, flag)?);
            }
            "--duration-secs" => {
                cli.duration_secs =
                    Some(parse_number(flag_value(args, &mut index, flag)?, flag)?);
            }
            "--log-file" => cli.log_file = Some(flag_value(args, &mut index, flag)?.into()),
            "--seed" => cli.seed = Some(parse_number(flag_value(args, &mut index, flag)?, flag)?),
            "-h" | "--help" => {
                print_help();
                return Err(String::new());
            }
            unknown => return Err(format!("unknown option: {unknown}")),
        }
        index += 1;
    }
    Ok(cli)
}

/// File values first, then flags.
fn resolve_config(cli: &CliArgs) -> Result<CollectorConfig, String> {
    let mut config = match &cli.config {
        Some(path) => CollectorConfig::load(path).map_err(|err| err.to_string())?,
        None => CollectorConfig::default(),
    };
    if let Some(threshold) = cli.threshold {
        config.flush_threshold = threshold;
    }
    if let Some(store) = &cli.store {
        config.store_path.clone_from(store);
    }
    if let Some(spill) = &cli.spill {
        config.spill_path.clone_from(spill);
    }
    if let Some(max_size_mb) = cli.max_size_mb {
        config.max_store_size_mb = max_size_mb;
        config.max_store_size_bytes = None;
    }
    if let Some(batch_size) = cli.batch_size {
        config.ingest_batch_size = batch_size;
    }
    if let Some(interval_ms) = cli.interval_ms {
        config.ingest_interval_ms = interval_ms;
    }
    if cli.log_file.is_some() {
        config.log_file.clone_from(&cli.log_file);
    }
    config.validate().map_err(|err| err.to_string())?;
    Ok(config)
}

fn init_tracing(log_file: Option<&PathBuf>) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| format!("cannot open log file {}: {err}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|err| err.to_string())
        }
        None => builder
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|err| err.to_string()),
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}

/// Cancel `cx` on SIGINT/SIGTERM from a dedicated thread.
fn spawn_signal_watcher(cx: Cx) {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(error = %err, "signal runtime unavailable; stop with --duration-secs");
                return;
            }
        };
        runtime.block_on(wait_for_shutdown_signal());
        cx.cancel();
    });
}

fn spawn_deadline(cx: Cx, after: Duration) {
    thread::spawn(move || {
        thread::sleep(after);
        info!(seconds = after.as_secs(), "run duration reached");
        cx.cancel();
    });
}

fn run(args: &[String]) -> Result<(), String> {
    let cli = parse_args(args)?;
    let config = resolve_config(&cli)?;
    init_tracing(config.log_file.as_ref())?;

    info!(
        store = %config.store_path.display(),
        spill = %config.spill_path.display(),
        flush_threshold = config.flush_threshold,
        batch_size = config.ingest_batch_size,
        interval_ms = config.ingest_interval_ms,
        "flowlogd starting"
    );

    let mut controller = Controller::open(&config).map_err(|err| {
        error!(error = %err, fatal = err.is_fatal(), "startup failed");
        err.to_string()
    })?;

    let cx = Cx::new();
    spawn_signal_watcher(cx.clone());
    if let Some(secs) = cli.duration_secs {
        spawn_deadline(cx.clone(), Duration::from_secs(secs));
    }

    let mut generator = Generator::new(cli.seed);
    let outcome = controller.run(
        &cx,
        &mut generator,
        config.ingest_batch_size,
        config.ingest_interval(),
    );

    let stats = serde_json::to_string_pretty(&controller.stats())
        .map_err(|err| format!("stats serialization failed: {err}"))?;
    println!("{stats}");
    outcome.map(|_| ()).map_err(|err| err.to_string())
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) if error.is_empty() => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("flowlogd: {error}");
            ExitCode::from(1)
        }
    }
}
