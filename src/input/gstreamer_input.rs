// 该文件是 Tingjing （听境） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频输入
//!
//! 支持两种地址：
//!
//! - `gst://camera/dev/video0?width=640&height=480&fps=15&rotate=90`
//! - `gst://file/path/to/video.mp4`
//!
//! 管道末端统一转换为 RGB 并接入 `appsink`，只保留最新的两帧。
//!
//! ## 系统依赖
//!
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{ChannelOrder, Frame},
  input::{CaptureError, FrameSource},
  url_path,
};

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  #[error("Unsupported video format: {0:?}")]
  UnsupportedFormat(gst_video::VideoFormat),
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

const GSTREAMER_INPUT_SCHEME: &str = "gst";

enum PipelineItem {
  FileSource(String),
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    width: u32,
    height: u32,
    fps: u32,
  },
  VideoFlip(u32),
  Convert,
}

impl PipelineItem {
  fn to_pipeline(&self) -> String {
    match self {
      PipelineItem::FileSource(path) => format!("filesrc location=\"{}\" ! decodebin", path),
      PipelineItem::CameraSource {
        camera,
        io_mode,
        width,
        height,
        fps,
      } => {
        let io_mode = io_mode
          .map(|mode| format!(" io-mode={}", mode))
          .unwrap_or_default();
        format!(
          "v4l2src device={}{} ! videoconvert ! video/x-raw,width={},height={},framerate={}/1",
          camera, io_mode, width, height, fps
        )
      }
      PipelineItem::VideoFlip(method) => format!("videoflip method={}", method),
      PipelineItem::Convert => "videoconvert ! video/x-raw,format=RGB".to_string(),
    }
  }
}

/// 从 URL 构建输入管道
pub struct GStreamerInputPipelineBuilder {
  items: Vec<PipelineItem>,
}

impl GStreamerInputPipelineBuilder {
  fn camera(path: String, query: &HashMap<String, String>) -> Self {
    let number = |key: &str, default: u32| {
      query
        .get(key)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
    };

    Self {
      items: vec![PipelineItem::CameraSource {
        camera: path,
        io_mode: query.get("io-mode").and_then(|v| v.parse().ok()),
        width: number("width", 640),
        height: number("height", 480),
        fps: number("fps", 15),
      }],
    }
  }

  fn video_flip(rotate: Option<&str>) -> Option<PipelineItem> {
    match rotate? {
      "90" => Some(PipelineItem::VideoFlip(1)),
      "180" => Some(PipelineItem::VideoFlip(2)),
      "270" => Some(PipelineItem::VideoFlip(3)),
      _ => None,
    }
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let description = format!(
      "{} ! appsink max-buffers=2 drop=true name=sink",
      self
        .items
        .iter()
        .map(PipelineItem::to_pipeline)
        .collect::<Vec<_>>()
        .join(" ! ")
    );
    info!("GStreamer 管道: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("无法创建管道".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkNotFound)?;

    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerInput {
      pipeline,
      appsink,
      sequence: 0,
      released: false,
    })
  }
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != GSTREAMER_INPUT_SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (k.into_owned(), v.into_owned()))
      .collect();

    let mut builder = match url.host_str() {
      Some("camera") => Self::camera(url_path(url), &query),
      Some("file") => Self {
        items: vec![PipelineItem::FileSource(url_path(url))],
      },
      _ => return Err(GStreamerInputError::SchemeMismatch),
    };

    if let Some(flip) = Self::video_flip(query.get("rotate").map(String::as_str)) {
      builder.items.push(flip);
    }
    builder.items.push(PipelineItem::Convert);

    Ok(builder)
  }
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = GSTREAMER_INPUT_SCHEME;
}

/// GStreamer 管道与 appsink
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  sequence: u64,
  released: bool,
}

impl FrameSource for GStreamerInput {
  fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
    if self.released {
      return Ok(None);
    }

    let sample = match self.appsink.pull_sample() {
      Ok(sample) => sample,
      Err(_) if self.appsink.is_eos() => return Ok(None),
      Err(e) => return Err(CaptureError::Device(format!("拉取帧失败: {}", e))),
    };

    let frame = convert_sample(&sample, self.sequence)?;
    self.sequence += 1;
    Ok(Some(frame))
  }

  fn release(&mut self) {
    if std::mem::replace(&mut self.released, true) {
      return;
    }
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止 GStreamer 管道失败: {}", e);
    }
  }
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    self.release();
  }
}

/// 按行拷贝，去掉行尾填充；BGR 样本保留原顺序并标注在帧上
fn convert_sample(sample: &gst::Sample, sequence: u64) -> Result<Frame, CaptureError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有缓冲区".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有 caps".to_string()))?;
  let info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let order = match info.format() {
    gst_video::VideoFormat::Rgb => ChannelOrder::Rgb,
    gst_video::VideoFormat::Bgr => ChannelOrder::Bgr,
    other => return Err(GStreamerInputError::UnsupportedFormat(other).into()),
  };

  let width = info.width() as usize;
  let height = info.height() as usize;
  let stride = info.stride()[0] as usize;
  let row = width * 3;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::PipelineError(format!("无法映射缓冲区: {}", e))
  })?;
  let data = map.as_slice();

  let expected = stride * (height.saturating_sub(1)) + row;
  if data.len() < expected {
    return Err(
      GStreamerInputError::BufferSizeMismatch {
        expected,
        actual: data.len(),
      }
      .into(),
    );
  }

  let mut pixels = Vec::with_capacity(row * height);
  for y in 0..height {
    pixels.extend_from_slice(&data[y * stride..y * stride + row]);
  }

  Ok(Frame::from_raw(
    info.width(),
    info.height(),
    order,
    sequence,
    pixels,
  )?)
}
