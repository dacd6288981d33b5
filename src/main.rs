// 该文件是 Tingjing （听境） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{path::PathBuf, process::ExitCode};

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use url::Url;

use tingjing::{
  FromUrl,
  audio::sink_from_config,
  config::Config,
  input::InputWrapper,
  output::OutputWrapper,
  task::{ContinuousTask, Pipeline, StopSignal, Task},
};

/// Tingjing 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入来源，例如 gst://camera/dev/video0、v4l:///dev/video0、folder:///data/frames
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径，例如 image:///tmp/latest.png、folder:///data/records
  #[arg(long, value_name = "OUTPUT", default_value = "null://")]
  pub output: Url,
  /// 目标检测模型
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 人体关键点模型，缺省时不识别手势
  #[arg(long, value_name = "MODEL")]
  pub pose_model: Option<Url>,
  /// 人脸网格模型，缺省时不识别表情
  #[arg(long, value_name = "MODEL")]
  pub face_model: Option<Url>,
  /// TOML 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
  /// 最大处理帧数，覆盖配置文件
  #[arg(long, value_name = "COUNT")]
  pub max_frames: Option<usize>,
}

fn run(args: Args) -> Result<()> {
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);
  info!("模型文件路径: {}", args.model);

  let config = match &args.config {
    Some(path) => Config::load(path)?,
    None => Config::default(),
  };
  let max_frames = args.max_frames.or(config.pipeline.max_frames);

  let pipeline = Pipeline::from_config(
    &config,
    &args.model,
    args.pose_model.as_ref(),
    args.face_model.as_ref(),
  )?;
  let output = OutputWrapper::from_url(&args.output)?;

  let source = match InputWrapper::from_url(&args.input) {
    Ok(source) => source,
    Err(e) => {
      error!("无法打开输入来源 {}: {}", args.input, e);
      return Ok(());
    }
  };

  let stop = StopSignal::new();
  stop.install_ctrlc()?;
  stop.watch_stdin();
  info!("按 Ctrl-C 或输入 q 回车退出");

  let task = ContinuousTask::new(stop)
    .with_frame_number(max_frames)
    .with_hold_frames(config.pose.hold_frames)
    .with_audio(sink_from_config(&config.audio));
  let summary = task.run_task(source, &pipeline, output)?;

  info!(
    "退出原因: {:?}, 处理 {} 帧, 丢弃 {} 帧",
    summary.exit, summary.frames_processed, summary.frames_dropped
  );
  Ok(())
}

fn main() -> ExitCode {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  match run(args) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      error!("{:#}", e);
      ExitCode::FAILURE
    }
  }
}
