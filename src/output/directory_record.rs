// 该文件是 Tingjing （听境） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  fs::File,
  io::BufWriter,
  path::{Path, PathBuf},
  sync::atomic::{AtomicU32, Ordering},
};

use chrono::{Datelike, Local};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  output::{
    Render,
    draw::{Draw, FontLoadError},
  },
  scene::SceneDescription,
  url_path,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("字体错误: {0}")]
  FontError(#[from] FontLoadError),
}

/// 按日期分目录保存叠加图和 JSON 场景记录
///
/// 没有检测结果的帧默认跳过，`?always` 时每帧都保存。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  draw: Draw,
  frame_counter: AtomicU32,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(url_path(uri)),
      draw: Draw::from_url(uri)?,
      frame_counter: AtomicU32::new(0),
      always: uri.query_pairs().any(|(k, _)| k == "always"),
    })
  }
}

impl DirectoryRecordOutput {
  fn frame_path(&self) -> Result<PathBuf, std::io::Error> {
    let now = Local::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    let id = self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
    Ok(directory.join(format!("{}-{:06}.png", now.format("%H-%M-%S"), id)))
  }

  fn write_record(path: &Path, scene: &SceneDescription) -> Result<(), DirectoryRecordOutputError> {
    let writer = BufWriter::new(File::create(path.with_extension("json"))?);
    serde_json::to_writer_pretty(writer, scene)?;
    Ok(())
  }
}

impl Render for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &Frame, scene: &SceneDescription) -> Result<(), Self::Error> {
    if !self.always && scene.detections.is_empty() {
      return Ok(());
    }

    let path = self.frame_path()?;
    self.draw.draw_scene(frame, scene).save(&path)?;
    Self::write_record(&path, scene)?;
    debug!("记录帧 {} 到 {}", scene.sequence, path.display());
    Ok(())
  }
}
