// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 最佳人脸帧采集 (Best face frame capture)
///
/// 多路摄像头并行: 每条人脸轨迹结束时输出一张质量最高的标注帧.
///
/// 运行演示 (无需模型和摄像头): cargo run --bin bestface --release -- --demo 2
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bestface_rs::config::{AppConfig, CameraConfig};
use bestface_rs::demo::SyntheticDetector;
use bestface_rs::input::open_source;
use bestface_rs::output::{JpegDirectorySink, OutputSink};
use bestface_rs::pipeline::{ShutdownSignal, Supervisor};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about = "多路摄像头最佳人脸帧采集", long_about = None)]
struct Args {
    /// 配置文件 (JSON)
    #[arg(short, long, default_value = "bestface.json")]
    config: PathBuf,

    /// 演示模式: N 路合成画面 + 合成检测器
    #[arg(long, value_name = "CAMERAS")]
    demo: Option<u32>,

    /// 演示模式每路帧数
    #[arg(long, default_value_t = 600)]
    demo_frames: u64,

    /// 演示检测器随机种子
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// 覆盖输出目录
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 将生效配置写入文件后退出
    #[arg(long, value_name = "PATH")]
    save_config: Option<PathBuf>,

    /// 日志详细程度 (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}

fn load_config(args: &Args) -> anyhow::Result<AppConfig> {
    let mut config = match args.demo {
        Some(n) => {
            let mut config = if args.config.exists() {
                AppConfig::load(&args.config)?
            } else {
                AppConfig::default()
            };
            config.cameras = (1..=n.max(1))
                .map(|id| CameraConfig {
                    id,
                    name: format!("demo-{}", id),
                    source: format!("synthetic://640x480?frames={}", args.demo_frames),
                })
                .collect();
            config
        }
        None => AppConfig::load(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?,
    };
    if let Some(dir) = &args.output {
        config.output.directory = dir.clone();
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(&args)?;
    if let Some(path) = &args.save_config {
        config.save(path)?;
        return Ok(());
    }

    info!("🚀 最佳人脸帧采集启动");
    config.print_summary();
    let supervisor = Supervisor::new(config)?;
    let output = &supervisor.config().output;

    let sink = JpegDirectorySink::new(&output.directory, output.jpeg_quality)?;
    if output.clear_on_start {
        sink.clear_existing()?;
    }
    let sink: Arc<dyn OutputSink> = Arc::new(sink);

    let shutdown = ShutdownSignal::new();
    let trigger = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("🛑 收到退出信号, 正在结束所有轨迹...");
        trigger.trigger();
    }) {
        warn!("⚠️ 无法注册 Ctrl+C 处理: {}", e);
    }

    // 真实部署时这里接入外部检测/跟踪模型
    let detector = SyntheticDetector::new(args.seed);
    let pipeline = supervisor.config().pipeline.clone();
    let results = supervisor.run(
        detector,
        |camera| open_source(camera, &pipeline),
        sink,
        shutdown,
    )?;

    let mut failed = 0;
    for result in &results {
        match &result.outcome {
            Ok(report) => info!(
                "📊 摄像头 {} ({}): 读取 {} | 处理 {} | 轨迹 {} | 输出 {}",
                report.camera_id,
                report.camera_name,
                report.frames_read,
                report.stats.frames_processed,
                report.stats.tracks_finalized,
                report.stats.artifacts_written
            ),
            Err(e) => {
                failed += 1;
                warn!("❌ 摄像头 {} ({}): {}", result.camera.id, result.camera.name, e);
            }
        }
    }
    info!("✅ 全部结束 ({} 路, {} 路异常)", results.len(), failed);
    Ok(())
}
