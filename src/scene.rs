// 该文件是 Tingjing （听境） 项目的一部分。
// src/scene.rs - 多模态融合与场景描述
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use serde::Serialize;

use crate::{
  config::DistanceConfig,
  frame::Frame,
  model::{Detection, ExpressionLabel, GestureState},
};

mod distance;
mod filter;

pub use self::distance::DistanceEstimator;
pub use self::filter::StableState;

/// 画面水平三等分后的方位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  Left,
  Center,
  Right,
}

impl Direction {
  /// 边界 `W/3` 与 `2W/3` 左闭
  pub fn from_center(center_x: f32, frame_width: u32) -> Self {
    let x = center_x as f64 * 3.0;
    let width = frame_width as f64;
    if x < width {
      Direction::Left
    } else if x < 2.0 * width {
      Direction::Center
    } else {
      Direction::Right
    }
  }

  pub fn word(self) -> &'static str {
    match self {
      Direction::Left => "left",
      Direction::Center => "center",
      Direction::Right => "right",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneObject {
  #[serde(flatten)]
  pub detection: Detection,
  pub direction: Direction,
  /// 估计距离（与参考宽度同单位）
  pub distance: Option<f32>,
}

/// 单帧融合结果，构造后不再修改
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneDescription {
  pub sequence: u64,
  pub width: u32,
  pub height: u32,
  pub detections: Vec<SceneObject>,
  pub gesture: GestureState,
  pub expression: ExpressionLabel,
  pub summary_text: String,
}

impl SceneDescription {
  /// 摘要为空时这一帧不播报
  pub fn is_silent(&self) -> bool {
    self.summary_text.is_empty()
  }
}

/// `"<label> on your <direction>"`，按检测顺序以逗号连接
pub fn summarize(objects: &[SceneObject]) -> String {
  objects
    .iter()
    .map(|object| format!("{} on your {}", object.detection.label, object.direction.word()))
    .collect::<Vec<_>>()
    .join(", ")
}

/// 融合三个阶段的输出
pub struct Synthesizer {
  distance: DistanceEstimator,
}

impl Synthesizer {
  pub fn new(config: &DistanceConfig) -> Self {
    Self {
      distance: DistanceEstimator::new(config),
    }
  }

  pub fn fuse(
    &self,
    frame: &Frame,
    detections: Vec<Detection>,
    gesture: GestureState,
    expression: ExpressionLabel,
  ) -> SceneDescription {
    let detections = detections
      .into_iter()
      .map(|detection| SceneObject {
        direction: Direction::from_center(detection.bbox.center_x(), frame.width()),
        distance: self.distance.estimate(&detection),
        detection,
      })
      .collect::<Vec<_>>();

    SceneDescription {
      sequence: frame.sequence(),
      width: frame.width(),
      height: frame.height(),
      summary_text: summarize(&detections),
      detections,
      gesture,
      expression,
    }
  }
}

impl Default for Synthesizer {
  fn default() -> Self {
    Self::new(&DistanceConfig::default())
  }
}
