// 该文件是 Tingjing （听境） 项目的一部分。
// src/model/pose.rs - 人体关键点与手势
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use serde::Serialize;

use crate::{
  frame::Frame,
  model::{InferenceError, Model},
};

/// 33 点人体拓扑中的关键点编号
pub const NOSE: usize = 0;
pub const LEFT_WRIST: usize = 15;
pub const RIGHT_WRIST: usize = 16;
pub const BODY_LANDMARKS: usize = 33;

/// 归一化坐标下的关键点，原点在左上角
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Landmark {
  pub x: f32,
  pub y: f32,
  pub z: f32,
  pub visibility: f32,
}

/// 一个人体的关键点集合
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BodyLandmarkSet {
  landmarks: Vec<Landmark>,
}

impl BodyLandmarkSet {
  pub fn new(landmarks: Vec<Landmark>) -> Self {
    Self { landmarks }
  }

  pub fn get(&self, index: usize) -> Option<&Landmark> {
    self.landmarks.get(index)
  }

  pub fn len(&self) -> usize {
    self.landmarks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.landmarks.is_empty()
  }

  pub fn landmarks(&self) -> &[Landmark] {
    &self.landmarks
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GestureState {
  HandsRaised,
  HandsLowered,
  Neutral,
  Undetermined,
}

impl GestureState {
  pub fn label(self) -> &'static str {
    match self {
      GestureState::HandsRaised => "Hands raised",
      GestureState::HandsLowered => "Hands lowered",
      GestureState::Neutral => "Neutral position",
      GestureState::Undetermined => "No action detected",
    }
  }
}

/// 关键点提取黑盒，每帧至多返回一个人体
pub trait PoseExtractor: Send + Sync {
  fn extract(&self, frame: &Frame) -> Result<Option<BodyLandmarkSet>, InferenceError>;
}

/// 只看鼻子和两只手腕的纵坐标
pub fn classify_gesture(landmarks: &BodyLandmarkSet, min_visibility: f32) -> GestureState {
  let visible = |index| {
    landmarks
      .get(index)
      .filter(|point| point.visibility > min_visibility)
  };

  let (Some(nose), Some(left), Some(right)) = (visible(NOSE), visible(LEFT_WRIST), visible(RIGHT_WRIST))
  else {
    return GestureState::Undetermined;
  };

  if left.y < nose.y && right.y < nose.y {
    GestureState::HandsRaised
  } else if left.y > nose.y && right.y > nose.y {
    GestureState::HandsLowered
  } else {
    GestureState::Neutral
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoseResult {
  pub landmarks: Option<BodyLandmarkSet>,
  pub gesture: GestureState,
}

impl PoseResult {
  pub fn undetermined() -> Self {
    Self {
      landmarks: None,
      gesture: GestureState::Undetermined,
    }
  }
}

/// 姿态阶段；没有提取器时每帧都是 `Undetermined`
pub struct PoseStage {
  extractor: Option<Box<dyn PoseExtractor>>,
  min_visibility: f32,
}

impl PoseStage {
  pub fn new(extractor: Option<Box<dyn PoseExtractor>>, min_visibility: f32) -> Self {
    Self {
      extractor,
      min_visibility,
    }
  }

  pub fn disabled() -> Self {
    Self::new(None, 0.5)
  }
}

impl Model for PoseStage {
  type Input = Frame;
  type Output = PoseResult;
  type Error = InferenceError;

  fn infer(&self, frame: &Frame) -> Result<PoseResult, InferenceError> {
    let Some(extractor) = &self.extractor else {
      return Ok(PoseResult::undetermined());
    };

    Ok(match extractor.extract(frame)? {
      Some(landmarks) => PoseResult {
        gesture: classify_gesture(&landmarks, self.min_visibility),
        landmarks: Some(landmarks),
      },
      None => PoseResult::undetermined(),
    })
  }
}
