use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use courier::app::Application;
use courier::shutdown::{wait_for_shutdown_signal, ShutdownManager};
use courier_config::{AppConfig, MessageQueueConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("courier")
        .version(env!("CARGO_PKG_VERSION"))
        .about("带死信与积压排空跟踪的消息队列消费/发布客户端")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径（缺省时搜索默认路径）"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("broker")
                .short('b')
                .long("broker")
                .value_name("TYPE")
                .help("broker 类型，覆盖配置文件")
                .value_parser(["rabbitmq", "in_memory"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).context("加载配置失败")?;

    if let Some(broker) = matches.get_one::<String>("broker") {
        config.message_queue.broker = MessageQueueConfig::parse_type_string(broker)?;
    }

    let log_level = matches
        .get_one::<String>("log-level")
        .cloned()
        .unwrap_or_else(|| config.logging.level.to_string());
    let log_format = matches
        .get_one::<String>("log-format")
        .cloned()
        .unwrap_or_else(|| match config.logging.format {
            courier_config::OutputFormat::Json => "json".to_string(),
            courier_config::OutputFormat::Pretty => "pretty".to_string(),
        });
    init_logging(&log_level, &log_format)?;

    info!("启动 courier");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }
    info!(
        broker = config.message_queue.get_type_string(),
        address = %config.message_queue.credentials.redacted(),
        "消息队列配置"
    );

    let grace = config.message_queue.shutdown_grace();
    let mut app = Application::new(config).await?;
    app.start().await?;

    let shutdown_manager = ShutdownManager::new();
    let app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e:#}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    // 服务自身的宽限期之外再留出关闭连接的时间
    match tokio::time::timeout(grace + Duration::from_secs(5), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("courier 已退出");
    Ok(())
}

/// 初始化日志系统，`RUST_LOG` 优先于命令行和配置
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}
