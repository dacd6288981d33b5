// 该文件是 Tingjing （听境） 项目的一部分。
// src/model.rs - 模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{path::Path, time::Duration};

use serde::Serialize;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::config::{StartupConfigError, read_required};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 推理阶段的错误
#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("模型输出格式错误: {0}")]
  MalformedOutput(String),
  #[error("特征长度不匹配: 期望 {expected}, 实际 {actual}")]
  FeatureMismatch { expected: usize, actual: usize },
  #[error("推理超时: {elapsed:?} 超过 {deadline:?}")]
  DeadlineExceeded { elapsed: Duration, deadline: Duration },
  #[error("推理后端错误: {0}")]
  Backend(String),
}

impl InferenceError {
  /// 可恢复的错误只丢弃当前帧；后端故障无法在本地恢复
  pub fn is_recoverable(&self) -> bool {
    !matches!(self, InferenceError::Backend(_))
  }
}

/// 像素坐标下的矩形框
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl BBox {
  pub fn center_x(&self) -> f32 {
    self.x + self.width / 2.0
  }

  pub fn area(&self) -> f32 {
    self.width * self.height
  }

  pub fn iou(&self, other: &BBox) -> f32 {
    let x1 = self.x.max(other.x);
    let y1 = self.y.max(other.y);
    let x2 = (self.x + self.width).min(other.x + other.width);
    let y2 = (self.y + self.height).min(other.y + other.height);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }
}

/// 单个检测结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  pub label: String,
  pub confidence: f32,
  #[serde(rename = "box")]
  pub bbox: BBox,
}

/// 类别名称表，按行号对应类别编号
#[derive(Debug, Clone)]
pub struct Labels {
  names: Box<[String]>,
}

impl Labels {
  pub fn from_file(path: &Path) -> Result<Self, StartupConfigError> {
    let content = read_required("类别标签", path)?;
    let labels = Self::parse(&content);
    if labels.is_empty() {
      return Err(StartupConfigError::Dataset {
        path: path.to_path_buf(),
        line: 1,
        reason: "类别标签文件为空".to_string(),
      });
    }
    info!("加载 {} 个类别标签: {}", labels.len(), path.display());
    Ok(labels)
  }

  /// 每行一个类别，中间的空行也占一个编号；只去掉末尾的空行
  pub fn parse(content: &str) -> Self {
    let mut names = content
      .lines()
      .map(|line| line.trim().to_string())
      .collect::<Vec<_>>();
    while names.last().is_some_and(String::is_empty) {
      names.pop();
    }
    Self {
      names: names.into_boxed_slice(),
    }
  }

  pub fn get(&self, id: usize) -> Option<&str> {
    self.names.get(id).map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}

impl<S: Into<String>> FromIterator<S> for Labels {
  fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
    Self {
      names: iter.into_iter().map(Into::into).collect(),
    }
  }
}

mod detection;
mod expression;
#[cfg(feature = "onnx")]
mod onnx;
mod pose;

pub use self::detection::{
  DetectionStage, DetectorBackend, InputTensor, PreprocessConfig, RawCandidates, decode_candidates,
  preprocess, suppress_overlaps,
};
pub use self::expression::{
  ExpressionLabel, ExpressionStage, FaceLandmarkSet, FaceMeshExtractor, KnnClassifier,
  ReferenceSet,
};
#[cfg(feature = "onnx")]
pub use self::onnx::{OnnxDetector, OnnxFaceMesh, OnnxPoseExtractor};
pub use self::pose::{
  BODY_LANDMARKS, BodyLandmarkSet, GestureState, LEFT_WRIST, Landmark, NOSE, PoseExtractor,
  PoseResult, PoseStage, RIGHT_WRIST, classify_gesture,
};

const ONNX_SCHEME: &str = "onnx";

fn unsupported(url: &Url) -> StartupConfigError {
  if url.scheme() == ONNX_SCHEME {
    StartupConfigError::UnsupportedModel(format!("{} (未启用 onnx 特性)", url))
  } else {
    StartupConfigError::UnsupportedModel(url.to_string())
  }
}

/// 按 URL 方案创建检测模型后端
pub fn detector_from_url(url: &Url) -> Result<Box<dyn DetectorBackend>, StartupConfigError> {
  #[cfg(feature = "onnx")]
  {
    use crate::FromUrl;

    if url.scheme() == ONNX_SCHEME {
      return Ok(Box::new(OnnxDetector::from_url(url)?));
    }
  }
  Err(unsupported(url))
}

/// 按 URL 方案创建人体关键点后端
pub fn pose_extractor_from_url(url: &Url) -> Result<Box<dyn PoseExtractor>, StartupConfigError> {
  #[cfg(feature = "onnx")]
  {
    use crate::FromUrl;

    if url.scheme() == ONNX_SCHEME {
      return Ok(Box::new(OnnxPoseExtractor::from_url(url)?));
    }
  }
  Err(unsupported(url))
}

/// 按 URL 方案创建人脸网格后端
pub fn face_mesh_from_url(url: &Url) -> Result<Box<dyn FaceMeshExtractor>, StartupConfigError> {
  #[cfg(feature = "onnx")]
  {
    use crate::FromUrl;

    if url.scheme() == ONNX_SCHEME {
      return Ok(Box::new(OnnxFaceMesh::from_url(url)?));
    }
  }
  Err(unsupported(url))
}
