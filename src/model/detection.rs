// 该文件是 Tingjing （听境） 项目的一部分。
// src/model/detection.rs - 目标检测阶段
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::imageops::{self, FilterType};
use tracing::debug;

use crate::{
  config::DetectionConfig,
  frame::{ChannelOrder, Frame},
  model::{BBox, Detection, InferenceError, Labels, Model},
};

/// 输入预处理参数
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
  pub target_size: u32,
  pub scale_factor: f32,
  /// 按模型通道顺序给出的均值
  pub mean: [f32; 3],
  pub channel_order: ChannelOrder,
}

impl From<&DetectionConfig> for PreprocessConfig {
  fn from(config: &DetectionConfig) -> Self {
    Self {
      target_size: config.target_size,
      scale_factor: config.scale_factor,
      mean: config.mean,
      channel_order: config.channel_order,
    }
  }
}

/// NCHW 格式的 f32 输入张量
#[derive(Debug, Clone)]
pub struct InputTensor {
  data: Vec<f32>,
  shape: [usize; 4],
}

impl InputTensor {
  pub fn shape(&self) -> [usize; 4] {
    self.shape
  }

  pub fn data(&self) -> &[f32] {
    &self.data
  }
}

/// 模型原始输出：`rows × stride` 的矩阵，每行一个候选框
///
/// 前四列是归一化的 `cx, cy, w, h`，类别分数从布局给出的偏移开始。
#[derive(Debug, Clone)]
pub struct RawCandidates {
  data: Vec<f32>,
  stride: usize,
}

impl RawCandidates {
  pub fn new(data: Vec<f32>, stride: usize) -> Result<Self, InferenceError> {
    if stride == 0 || data.len() % stride != 0 {
      return Err(InferenceError::MalformedOutput(format!(
        "输出长度 {} 不是行宽 {} 的整数倍",
        data.len(),
        stride
      )));
    }
    Ok(Self { data, stride })
  }

  pub fn stride(&self) -> usize {
    self.stride
  }

  pub fn rows(&self) -> usize {
    self.data.len() / self.stride
  }

  pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
    self.data.chunks_exact(self.stride)
  }
}

/// 检测模型黑盒：输入张量，输出候选矩阵
pub trait DetectorBackend: Send + Sync {
  fn forward(&self, input: &InputTensor) -> Result<RawCandidates, InferenceError>;
}

/// 缩放到 `target_size × target_size`，减均值、乘比例，转为 NCHW
pub fn preprocess(frame: &Frame, config: &PreprocessConfig) -> InputTensor {
  let image = frame.to_rgb_image();
  let size = config.target_size;
  let resized = imageops::resize(&image, size, size, FilterType::Triangle);

  let plane = size as usize * size as usize;
  let swap = config.channel_order == ChannelOrder::Bgr;
  let mut data = vec![0.0f32; 3 * plane];

  for (idx, pixel) in resized.pixels().enumerate() {
    for c in 0..3 {
      let src = if swap { 2 - c } else { c };
      data[c * plane + idx] = (pixel[src] as f32 - config.mean[c]) * config.scale_factor;
    }
  }

  InputTensor {
    data,
    shape: [1, 3, size as usize, size as usize],
  }
}

/// 解码候选框：取最高类别分数，过滤阈值，按原始帧尺寸还原像素坐标
pub fn decode_candidates(
  raw: &RawCandidates,
  score_offset: usize,
  labels: &Labels,
  threshold: f32,
  frame_width: u32,
  frame_height: u32,
) -> Result<Vec<Detection>, InferenceError> {
  let expected = score_offset + labels.len();
  if raw.stride() != expected {
    return Err(InferenceError::MalformedOutput(format!(
      "候选行宽为 {}, 期望 {} (偏移 {} + 类别 {})",
      raw.stride(),
      expected,
      score_offset,
      labels.len()
    )));
  }

  let (fw, fh) = (frame_width as f32, frame_height as f32);
  let mut detections = Vec::new();

  for row in raw.iter() {
    let scores = &row[score_offset..];
    let mut class_id = 0usize;
    let mut confidence = f32::NEG_INFINITY;
    for (id, &score) in scores.iter().enumerate() {
      if score > confidence {
        confidence = score;
        class_id = id;
      }
    }

    if !(confidence > threshold) {
      continue;
    }

    let (cx, cy, w, h) = (row[0] * fw, row[1] * fh, row[2] * fw, row[3] * fh);
    if !(cx.is_finite() && cy.is_finite() && w.is_finite() && h.is_finite()) {
      continue;
    }

    // 裁剪到帧内
    let x0 = (cx - w / 2.0).clamp(0.0, fw);
    let y0 = (cy - h / 2.0).clamp(0.0, fh);
    let x1 = (cx + w / 2.0).clamp(0.0, fw);
    let y1 = (cy + h / 2.0).clamp(0.0, fh);
    if x1 <= x0 || y1 <= y0 {
      continue;
    }

    let Some(label) = labels.get(class_id) else {
      continue;
    };

    detections.push(Detection {
      label: label.to_string(),
      confidence,
      bbox: BBox {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
      },
    });
  }

  Ok(detections)
}

/// 贪心非极大值抑制，结果按置信度降序
///
/// `class_aware` 为假时不区分类别，任意两个重叠超过阈值的框只保留置信度高的一个。
pub fn suppress_overlaps(
  mut detections: Vec<Detection>,
  iou_threshold: f32,
  class_aware: bool,
) -> Vec<Detection> {
  detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

  let mut suppressed = vec![false; detections.len()];
  let mut keep = Vec::with_capacity(detections.len());

  for i in 0..detections.len() {
    if suppressed[i] {
      continue;
    }
    for j in (i + 1)..detections.len() {
      if suppressed[j] {
        continue;
      }
      if class_aware && detections[i].label != detections[j].label {
        continue;
      }
      if detections[i].bbox.iou(&detections[j].bbox) > iou_threshold {
        suppressed[j] = true;
      }
    }
    keep.push(i);
  }

  let mut detections = detections.into_iter().map(Some).collect::<Vec<_>>();
  keep
    .into_iter()
    .filter_map(|i| detections[i].take())
    .collect()
}

/// 检测阶段：预处理、推理、解码、抑制
pub struct DetectionStage {
  backend: Box<dyn DetectorBackend>,
  labels: Labels,
  preprocess: PreprocessConfig,
  score_offset: usize,
  threshold: f32,
  nms_threshold: f32,
  class_aware: bool,
}

impl DetectionStage {
  pub fn new(backend: Box<dyn DetectorBackend>, labels: Labels, config: &DetectionConfig) -> Self {
    Self {
      backend,
      labels,
      preprocess: PreprocessConfig::from(config),
      score_offset: config.layout.score_offset(),
      threshold: config.threshold,
      nms_threshold: config.nms_threshold,
      class_aware: config.class_aware_nms,
    }
  }

  pub fn threshold(&self) -> f32 {
    self.threshold
  }
}

impl Model for DetectionStage {
  type Input = Frame;
  type Output = Vec<Detection>;
  type Error = InferenceError;

  fn infer(&self, frame: &Frame) -> Result<Self::Output, Self::Error> {
    let tensor = preprocess(frame, &self.preprocess);
    let raw = self.backend.forward(&tensor)?;
    let candidates = decode_candidates(
      &raw,
      self.score_offset,
      &self.labels,
      self.threshold,
      frame.width(),
      frame.height(),
    )?;
    debug!(
      "帧 {}: {} 个原始候选, {} 个超过阈值",
      frame.sequence(),
      raw.rows(),
      candidates.len()
    );
    Ok(suppress_overlaps(
      candidates,
      self.nms_threshold,
      self.class_aware,
    ))
  }
}
