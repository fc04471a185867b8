use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use common::now_secs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use visit_monitor::config::{render_config, AppConfig, ConfigManager, EnvConfigOverride, StreamConfig};
use visit_monitor::engine::{Engine, EngineBuilder};
use visit_monitor::mock::{FnDetector, MemoryClipEncoder, ScriptStep, ScriptedStreamSource};
use visit_monitor::notifier::LogTransport;
use visit_monitor::supervisor::SupervisorReport;

const DEFAULT_CONFIG: &str = "visit_monitor.toml";

fn cli() -> Command {
    Command::new("visit-monitor")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Tracks animal visits on camera streams, records clips and alerts on long visits")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Configuration file")
                .default_value(DEFAULT_CONFIG)
                .global(true),
        )
        .subcommand(Command::new("run").about("Monitor the configured streams (default)"))
        .subcommand(
            Command::new("check-config").about("Load and validate the configuration, then print it"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run the engine on synthetic streams with in-memory collaborators")
                .arg(
                    Arg::new("streams")
                        .long("streams")
                        .value_name("N")
                        .help("Number of synthetic streams")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("2"),
                )
                .arg(
                    Arg::new("visit-secs")
                        .long("visit-secs")
                        .value_name("SECONDS")
                        .help("How long the animal stays in frame")
                        .value_parser(clap::value_parser!(f64))
                        .default_value("50"),
                )
                .arg(
                    Arg::new("realtime")
                        .long("realtime")
                        .help("Pace synthetic frames at 10 fps instead of as fast as possible")
                        .action(ArgAction::SetTrue),
                ),
        )
}

fn init_logging(level: &str) {
    // RUST_LOG优先，其次使用配置中的日志级别
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    dotenvy::dotenv().ok();

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let mut manager = ConfigManager::new(config_path.clone());
    manager
        .load()
        .await
        .with_context(|| format!("loading {}", config_path.display()))?;
    let mut config = manager.into_config();

    let level = std::env::var("VISIT_MONITOR_LOG_LEVEL").unwrap_or_else(|_| config.logging.level.clone());
    init_logging(&level);
    EnvConfigOverride::apply_overrides(&mut config);

    match matches.subcommand() {
        Some(("check-config", _)) => check_config(&config),
        Some(("simulate", sub)) => {
            let streams = sub.get_one::<usize>("streams").copied().unwrap_or(2);
            let visit_secs = sub.get_one::<f64>("visit-secs").copied().unwrap_or(50.0);
            simulate(config, streams, visit_secs, sub.get_flag("realtime")).await
        }
        _ => run(config).await,
    }
}

fn check_config(config: &AppConfig) -> Result<()> {
    config.validate().context("configuration is invalid")?;
    println!("{}", render_config(config)?);
    info!("✓ Configuration valid ({} streams)", config.streams.len());
    Ok(())
}

async fn run(config: AppConfig) -> Result<()> {
    info!("🚀 Visit monitor starting...");
    let engine = EngineBuilder::new(config).build()?;
    supervise(engine).await
}

/// 模拟运行的配置：合成视频流，录像写到临时目录
fn simulation_config(mut config: AppConfig, streams: usize) -> AppConfig {
    // 内存编码器写出的是原始帧字节，与真实录像目录分开存放
    config.recording.output_dir = std::env::temp_dir().join("visit-monitor-sim");
    config.recording.extension = "bgr".to_string();
    config.streams = (0..streams.max(1))
        .map(|i| StreamConfig::new(format!("sim-{}", i), "synthetic"))
        .collect();
    config
}

async fn simulate(config: AppConfig, streams: usize, visit_secs: f64, realtime: bool) -> Result<()> {
    info!(
        "🧪 Simulating {} streams, {:.1}s visit (threshold {:.1}s, debounce {:.1}s)",
        streams,
        visit_secs,
        config.engine.alert_threshold.as_secs_f64(),
        config.engine.debounce.as_secs_f64()
    );

    // 所有模拟流使用相同的检测输入，各自独立产生访问
    let base = now_secs().floor();
    let arrive = base + 5.0;
    let leave = arrive + visit_secs;
    let end = leave + config.engine.debounce.as_secs_f64() + 5.0;

    let mut script = Vec::new();
    for step in ScriptStep::frames(base, end, 0.1) {
        if realtime {
            script.push(ScriptStep::Pause(Duration::from_millis(100)));
        }
        script.push(step);
    }
    script.push(ScriptStep::End);

    let config = simulation_config(config, streams);
    info!("Simulated clips go to {}", config.recording.output_dir.display());

    let mut source = ScriptedStreamSource::new();
    for stream in &config.streams {
        source = source.with_script(&stream.id, script.clone());
    }

    let engine = EngineBuilder::new(config)
        .with_source(Arc::new(source))
        .with_detector(Arc::new(FnDetector::by_time(move |t| t >= arrive && t < leave)))
        .with_encoder(Arc::new(MemoryClipEncoder::new()))
        .with_transport(Arc::new(LogTransport))
        .build()?;

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!("event: {}", json),
                    Err(e) => warn!("Failed to serialize event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => warn!("Event log lagging, {} events skipped", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    supervise(engine).await
}

async fn supervise(mut engine: Engine) -> Result<()> {
    let report = engine.start().await?;
    for (stream_id, reason) in &report.failed {
        warn!("Stream {} not started: {}", stream_id, reason);
    }

    let stop = engine.stop_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, stopping streams");
                stop.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    let reports = engine.wait().await;
    print_summary(&reports);

    for status in engine.status() {
        info!(
            "{}: {:?}, {} frames, {} visits, {} clips, {} alerts, {} reconnects",
            status.stream_id,
            status.state,
            status.frames_read,
            status.visits_completed,
            status.clips_saved,
            status.alerts_sent,
            status.reconnects
        );
    }

    info!("✓ Visit monitor shutdown complete");
    Ok(())
}

fn print_summary(reports: &[SupervisorReport]) {
    println!("\n--- Visit Monitor Summary ---");
    for report in reports {
        println!(
            "{}: stopped ({:?}) after {} frames, {} visits, {} reconnects",
            report.stream_id, report.reason, report.frames_read, report.visits_completed, report.reconnects
        );
    }
}
