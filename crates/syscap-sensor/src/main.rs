//! syscap - capture event pipeline front end
//!
//! Drives the ring reader, framer, and converter against simulated buffers
//! or stored streams, and reports what the host can offer for live capture.

use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use syscap_capture::{Event, EventGenerator, EventRecorder, GeneratorConfig, ReplaySource, StreamSet};
use syscap_convert::{Converter, RuleTable};
use syscap_core::events::catalog;
use syscap_core::metrics::create_metrics;
use syscap_core::{ConfigLoader, MetricsCollector, SyscapConfig, SYSCAP_VERSION};
use syscap_ring::platform;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "syscap")]
#[command(version)]
#[command(about = "Syscall event capture pipeline", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format for statistics and status
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    format: OutputFormat,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    /// Prometheus text exposition; status falls back to text
    Prometheus,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed synthetic events through in-memory buffers and drain them
    Demo {
        /// Number of events to produce in total (0 = until Ctrl+C)
        #[arg(long, default_value = "1000")]
        events: u64,

        /// Events produced per buffer on each tick
        #[arg(long, default_value = "16")]
        batch: usize,

        /// Tick interval in milliseconds
        #[arg(long, default_value = "100")]
        interval: u64,

        /// Produce current layouts instead of legacy ones
        #[arg(long)]
        current: bool,

        /// Write delivered events to a stored stream
        #[arg(short, long)]
        record: Option<PathBuf>,

        /// Print every delivered event
        #[arg(short, long)]
        print: bool,
    },

    /// Read a stored stream back through the converter
    Replay {
        /// Stored stream to read
        input: PathBuf,

        /// Deliver events exactly as stored
        #[arg(long)]
        no_convert: bool,

        /// Write the delivered events to a new stored stream
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print every delivered event
        #[arg(short, long)]
        print: bool,
    },

    /// Show platform capabilities and the effective configuration
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(cli.verbose, &config.sensor.log_level))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Demo {
            events,
            batch,
            interval,
            current,
            record,
            print,
        } => {
            demo_command(
                &config,
                DemoOptions {
                    events,
                    batch,
                    interval_ms: interval,
                    current,
                    record,
                    print,
                },
                cli.format,
            )
            .await
        }
        Commands::Replay {
            input,
            no_convert,
            output,
            print,
        } => replay_command(&config, &input, no_convert, output.as_deref(), print, cli.format),
        Commands::Status => status_command(&config, cli.config.as_deref(), cli.format),
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> SyscapConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet
            eprintln!("Failed to load configuration: {}, using defaults", e);
            SyscapConfig::default()
        }
    }
}

/// CLI verbosity takes precedence over the configured level
fn log_level(verbose: u8, configured: &str) -> Level {
    match verbose {
        0 => match configured.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// One-line rendering of a delivered event
fn describe(event: &Event<'_>) -> String {
    format!(
        "{:>16} cpu={:<3} tid={:<8} {:<14} nparams={}{}",
        event.ts(),
        event.buffer(),
        event.tid(),
        catalog::type_name(event.event_type()),
        event.nparams(),
        if event.was_converted() { " (converted)" } else { "" }
    )
}

fn print_stats(metrics: &MetricsCollector, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&metrics.to_json())?),
        OutputFormat::Prometheus => print!("{}", metrics.to_prometheus()),
        OutputFormat::Text => {
            let totals = metrics.totals();
            println!();
            println!("  Delivered:           {}", totals.delivered_events);
            println!("  Converted:           {}", totals.converted_events);
            println!("  Conversion failures: {}", totals.conversion_failures);
            println!("  Lost events:         {}", totals.lost_events);
            println!("  Framing errors:      {}", totals.framing_errors);
            println!("  Bytes committed:     {}", totals.bytes_committed);
            println!();
        }
    }
    Ok(())
}

struct DemoOptions {
    events: u64,
    batch: usize,
    interval_ms: u64,
    current: bool,
    record: Option<PathBuf>,
    print: bool,
}

/// Demo mode - synthetic producers feeding heap-backed rings
async fn demo_command(
    config: &SyscapConfig,
    options: DemoOptions,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let metrics = create_metrics();
    let table = Arc::new(RuleTable::legacy());
    let (mut set, mut producers) = StreamSet::open_simulated(config, table, metrics.clone())?;

    let mut generators: Vec<EventGenerator> = producers
        .iter()
        .map(|producer| {
            EventGenerator::with_config(GeneratorConfig {
                base_tid: 1000 + producer.id() as u64 * 100,
                legacy: !options.current,
                ..Default::default()
            })
        })
        .collect();

    let mut recorder = match &options.record {
        Some(path) => Some(EventRecorder::create(path)?),
        None => None,
    };

    info!(
        "Demo started: {} buffers, {} layouts",
        set.len(),
        if options.current { "current" } else { "legacy" }
    );
    if options.events == 0 {
        println!("  Press Ctrl+C to stop");
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(options.interval_ms.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut produced = 0u64;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            _ = ticker.tick() => {}
        }

        for (producer, generator) in producers.iter_mut().zip(generators.iter_mut()) {
            let mut want = options.batch;
            if options.events > 0 {
                want = want.min(options.events.saturating_sub(produced) as usize);
            }
            produced += generator.fill(producer, want)? as u64;
        }

        drain_set(&mut set, recorder.as_mut(), options.print)?;

        if options.events > 0 && produced >= options.events {
            break;
        }
    }

    drain_set(&mut set, recorder.as_mut(), options.print)?;
    if let Some(recorder) = recorder {
        let events = recorder.events();
        recorder.finish()?;
        info!("Recorded {} events", events);
    }

    info!("Demo stopped after {} produced events", produced);
    print_stats(&metrics, format)
}

/// Pull until every buffer is empty
fn drain_set(
    set: &mut StreamSet,
    mut recorder: Option<&mut EventRecorder<BufWriter<File>>>,
    print: bool,
) -> anyhow::Result<u64> {
    let mut delivered = 0;
    loop {
        match set.next_event() {
            Ok(Some(event)) => {
                if let Some(recorder) = recorder.as_deref_mut() {
                    recorder.record(event.view())?;
                }
                if print {
                    println!("{}", describe(&event));
                }
                delivered += 1;
            }
            Ok(None) => break,
            Err(e) if e.is_conversion() => warn!("{}", e),
            Err(e) if e.is_framing() => {
                // A bad record stays in place; try again on the next tick
                warn!("{}", e);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(delivered)
}

fn replay_command(
    config: &SyscapConfig,
    input: &Path,
    no_convert: bool,
    output: Option<&Path>,
    print: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let metrics = create_metrics();
    let converter = Converter::from_settings(Arc::new(RuleTable::legacy()), &config.converter);
    let mut source = ReplaySource::open(input, converter, metrics.buffer(0))?
        .with_conversion(config.converter.enabled && !no_convert);

    let mut recorder = match output {
        Some(path) => Some(EventRecorder::create(path)?),
        None => None,
    };

    loop {
        match source.next_event() {
            Ok(Some(event)) => {
                if let Some(recorder) = recorder.as_mut() {
                    recorder.record(event.view())?;
                }
                if print {
                    println!("{}", describe(&event));
                }
            }
            Ok(None) => break,
            Err(e) if e.is_conversion() || e.is_framing() => warn!("{}", e),
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(recorder) = recorder {
        recorder.finish()?;
    }
    info!("Replayed {} bytes from {}", source.position(), input.display());
    print_stats(&metrics, format)
}

fn status_command(
    config: &SyscapConfig,
    cli_path: Option<&Path>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let kernel = platform::kernel_version().map(|(major, minor, patch)| format!("{}.{}.{}", major, minor, patch));
    let config_path = cli_path
        .map(Path::to_path_buf)
        .or_else(ConfigLoader::default_config_path);

    if format == OutputFormat::Json {
        let status = serde_json::json!({
            "version": SYSCAP_VERSION,
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "root": platform::is_root(),
            "bpf_available": platform::check_bpf_available(),
            "kernel": kernel,
            "online_cpus": platform::online_cpus(),
            "config_path": config_path,
            "config": config,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!("syscap v{}", SYSCAP_VERSION);
    println!();
    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    println!("  Running as root: {}", platform::is_root());
    println!("  BPF available:   {}", platform::check_bpf_available());
    if let Some(kernel) = kernel {
        println!("  Kernel:          {}", kernel);
    }
    println!("  Online CPUs:     {}", platform::online_cpus());

    println!();
    println!("Configuration:");
    if let Some(path) = config_path {
        println!("  File:            {}", path.display());
    }
    println!("  Log level:       {}", config.sensor.log_level);
    println!(
        "  Buffers:         {}",
        match config.capture.buffer_count {
            0 => "one per CPU".to_string(),
            n => n.to_string(),
        }
    );
    println!("  Buffer size:     {} bytes", config.capture.data_size());
    println!("  Conversion:      {}", config.converter.enabled);
    println!("  Max passes:      {}", config.converter.max_passes);
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_overrides_config() {
        assert_eq!(log_level(0, "debug"), Level::DEBUG);
        assert_eq!(log_level(0, "ERROR"), Level::ERROR);
        assert_eq!(log_level(0, "bogus"), Level::WARN);
        assert_eq!(log_level(1, "error"), Level::INFO);
        assert_eq!(log_level(2, "error"), Level::DEBUG);
        assert_eq!(log_level(5, "error"), Level::TRACE);
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["syscap", "-vv", "demo", "--events", "10", "--current"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Commands::Demo {
                events: 10,
                current: true,
                ..
            }
        ));

        let cli = Cli::try_parse_from(["syscap", "replay", "in.scap", "--format", "json"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Replay { no_convert: false, .. }));
    }

    #[test]
    fn test_prometheus_format_is_accepted() {
        let cli = Cli::try_parse_from(["syscap", "--format", "prometheus", "demo"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Prometheus);

        let metrics = MetricsCollector::new();
        print_stats(&metrics, OutputFormat::Prometheus).unwrap();
        assert!(metrics.to_prometheus().contains("syscap_uptime_seconds"));
    }
}
