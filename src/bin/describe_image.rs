// 该文件是 Tingjing （听境） 项目的一部分。
// src/bin/describe_image.rs - 单张图像场景描述
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use tingjing::{
  FromUrl,
  config::Config,
  input::InputWrapper,
  output::OutputWrapper,
  task::{OneShotTask, Pipeline, Task},
};

/// 处理一张图像并把场景描述以 JSON 打印到标准输出
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 叠加图输出路径
  #[arg(long, value_name = "OUTPUT", default_value = "null://")]
  pub output: Url,
  /// 目标检测模型
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  #[arg(long, value_name = "MODEL")]
  pub pose_model: Option<Url>,
  #[arg(long, value_name = "MODEL")]
  pub face_model: Option<Url>,
  /// TOML 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let config = match &args.config {
    Some(path) => Config::load(path)?,
    None => Config::default(),
  };
  let pipeline = Pipeline::from_config(
    &config,
    &args.model,
    args.pose_model.as_ref(),
    args.face_model.as_ref(),
  )?;
  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let scene = OneShotTask.run_task(input, &pipeline, output)?;
  println!("{}", serde_json::to_string_pretty(&scene)?);

  Ok(())
}
