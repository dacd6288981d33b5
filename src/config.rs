// 该文件是 Tingjing （听境） 项目的一部分。
// src/config.rs - 运行配置与启动校验
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

//! 配置文件为 TOML 格式，所有字段都有默认值，缺省的文件等价于全部默认。
//!
//! ```toml
//! [detection]
//! threshold = 0.5
//! nms_threshold = 0.4
//! labels = "coco.names"
//!
//! [audio]
//! engine = "espeak"
//! rate = 150
//!
//! [distance.reference_widths]
//! person = 45.0
//! ```

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::frame::ChannelOrder;

/// 启动阶段的配置错误，出现即在进入主循环之前退出
#[derive(Error, Debug)]
pub enum StartupConfigError {
  #[error("缺少{what}文件: {}", path.display())]
  MissingFile { what: &'static str, path: PathBuf },
  #[error("读取文件 {} 失败: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("配置文件解析失败: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("数据集 {} 第 {line} 行格式错误: {reason}", path.display())]
  Dataset {
    path: PathBuf,
    line: usize,
    reason: String,
  },
  #[error("配置项 {field} 取值无效: {reason}")]
  InvalidValue { field: &'static str, reason: String },
  #[error("表情特征长度不匹配: 参考数据为 {reference}, 实时特征为 {live}")]
  FeatureWidth { reference: usize, live: usize },
  #[error("不支持的模型地址: {0}")]
  UnsupportedModel(String),
  #[error("模型加载失败: {0}")]
  ModelLoad(String),
}

impl StartupConfigError {
  fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
    StartupConfigError::InvalidValue {
      field,
      reason: reason.into(),
    }
  }
}

/// 读取启动必需的文件，文件不存在时报告为缺失
pub fn read_required(what: &'static str, path: &Path) -> Result<String, StartupConfigError> {
  std::fs::read_to_string(path).map_err(|source| {
    if source.kind() == std::io::ErrorKind::NotFound {
      StartupConfigError::MissingFile {
        what,
        path: path.to_path_buf(),
      }
    } else {
      StartupConfigError::Io {
        path: path.to_path_buf(),
        source,
      }
    }
  })
}

/// 检测框候选的排列方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateLayout {
  /// cx, cy, w, h, objectness, 类别分数...
  Darknet,
  /// cx, cy, w, h, 类别分数...
  Plain,
}

impl CandidateLayout {
  pub fn score_offset(self) -> usize {
    match self {
      CandidateLayout::Darknet => 5,
      CandidateLayout::Plain => 4,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
  pub threshold: f32,
  pub nms_threshold: f32,
  pub class_aware_nms: bool,
  pub target_size: u32,
  pub scale_factor: f32,
  pub mean: [f32; 3],
  /// 模型期望的通道顺序，与帧的顺序不同时交换 R/B
  pub channel_order: ChannelOrder,
  pub layout: CandidateLayout,
  pub labels: PathBuf,
}

impl Default for DetectionConfig {
  fn default() -> Self {
    Self {
      threshold: 0.5,
      nms_threshold: 0.4,
      class_aware_nms: false,
      target_size: 416,
      scale_factor: 0.00392,
      mean: [0.0, 0.0, 0.0],
      channel_order: ChannelOrder::Rgb,
      layout: CandidateLayout::Darknet,
      labels: PathBuf::from("coco.names"),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseConfig {
  pub min_visibility: f32,
  /// 手势需要连续出现的帧数，1 表示不做时间滤波
  pub hold_frames: usize,
}

impl Default for PoseConfig {
  fn default() -> Self {
    Self {
      min_visibility: 0.5,
      hold_frames: 1,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpressionConfig {
  pub dataset: PathBuf,
  /// 首个非空行是表头
  pub has_header: bool,
  pub k: usize,
  pub landmark_count: usize,
}

impl Default for ExpressionConfig {
  fn default() -> Self {
    Self {
      dataset: PathBuf::from("facial_expression_data_new.csv"),
      has_header: true,
      k: 3,
      landmark_count: 468,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEngine {
  Espeak,
  Log,
  None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
  pub engine: AudioEngine,
  /// 语速（每分钟词数）
  pub rate: u32,
  /// 音量 0.0 - 1.0
  pub volume: f32,
}

impl Default for AudioConfig {
  fn default() -> Self {
    Self {
      engine: AudioEngine::Espeak,
      rate: 150,
      volume: 1.0,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceConfig {
  /// 相机焦距（像素）
  pub focal_length: f32,
  /// 各类别的真实宽度（厘米）
  pub reference_widths: HashMap<String, f32>,
}

impl Default for DistanceConfig {
  fn default() -> Self {
    Self {
      focal_length: 650.0,
      reference_widths: HashMap::new(),
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  pub stage_deadline_ms: Option<u64>,
  pub parallel_stages: bool,
  pub max_frames: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub detection: DetectionConfig,
  pub pose: PoseConfig,
  pub expression: ExpressionConfig,
  pub audio: AudioConfig,
  pub distance: DistanceConfig,
  pub pipeline: PipelineConfig,
}

impl Config {
  pub fn load(path: &Path) -> Result<Self, StartupConfigError> {
    info!("读取配置文件: {}", path.display());
    let content = read_required("配置", path)?;
    Self::from_toml(&content)
  }

  pub fn from_toml(content: &str) -> Result<Self, StartupConfigError> {
    let config: Config = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
  }

  /// 校验数值范围；文件是否存在在加载标签和数据集时检查
  pub fn validate(&self) -> Result<(), StartupConfigError> {
    let unit = |field: &'static str, value: f32| {
      if (0.0..=1.0).contains(&value) {
        Ok(())
      } else {
        Err(StartupConfigError::invalid(
          field,
          format!("{} 不在 [0, 1] 范围内", value),
        ))
      }
    };

    unit("detection.threshold", self.detection.threshold)?;
    unit("detection.nms_threshold", self.detection.nms_threshold)?;
    unit("pose.min_visibility", self.pose.min_visibility)?;
    unit("audio.volume", self.audio.volume)?;

    if self.detection.target_size == 0 {
      return Err(StartupConfigError::invalid(
        "detection.target_size",
        "必须大于 0",
      ));
    }
    if !(self.detection.scale_factor.is_finite() && self.detection.scale_factor > 0.0) {
      return Err(StartupConfigError::invalid(
        "detection.scale_factor",
        "必须为正数",
      ));
    }
    if self.pose.hold_frames == 0 {
      return Err(StartupConfigError::invalid("pose.hold_frames", "至少为 1"));
    }
    if self.expression.k == 0 {
      return Err(StartupConfigError::invalid("expression.k", "至少为 1"));
    }
    if self.expression.landmark_count == 0 {
      return Err(StartupConfigError::invalid(
        "expression.landmark_count",
        "必须大于 0",
      ));
    }
    if !(self.distance.focal_length.is_finite() && self.distance.focal_length > 0.0) {
      return Err(StartupConfigError::invalid(
        "distance.focal_length",
        "必须为正数",
      ));
    }
    if let Some((label, width)) = self
      .distance
      .reference_widths
      .iter()
      .find(|(_, w)| !(w.is_finite() && **w > 0.0))
    {
      return Err(StartupConfigError::invalid(
        "distance.reference_widths",
        format!("{} 的宽度 {} 无效", label, width),
      ));
    }
    if self.pipeline.stage_deadline_ms == Some(0) {
      return Err(StartupConfigError::invalid(
        "pipeline.stage_deadline_ms",
        "必须大于 0",
      ));
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_file_means_defaults() {
    let config = Config::from_toml("").unwrap();
    assert_eq!(config.detection.threshold, 0.5);
    assert_eq!(config.detection.nms_threshold, 0.4);
    assert_eq!(config.detection.target_size, 416);
    assert_eq!(config.expression.k, 3);
    assert!(config.expression.has_header);
    assert_eq!(config.audio.rate, 150);
    assert_eq!(config.audio.engine, AudioEngine::Espeak);
    assert!(!config.pipeline.parallel_stages);
  }

  #[test]
  fn partial_sections_keep_other_defaults() {
    let config = Config::from_toml(
      r#"
      [detection]
      threshold = 0.6
      layout = "plain"

      [distance.reference_widths]
      person = 45.0
      "#,
    )
    .unwrap();
    assert_eq!(config.detection.threshold, 0.6);
    assert_eq!(config.detection.layout, CandidateLayout::Plain);
    assert_eq!(config.detection.nms_threshold, 0.4);
    assert_eq!(config.distance.reference_widths.get("person"), Some(&45.0));
  }

  #[test]
  fn out_of_range_threshold_is_rejected() {
    let err = Config::from_toml("[detection]\nthreshold = 1.5\n").unwrap_err();
    assert!(matches!(
      err,
      StartupConfigError::InvalidValue {
        field: "detection.threshold",
        ..
      }
    ));
  }

  #[test]
  fn zero_k_is_rejected() {
    assert!(Config::from_toml("[expression]\nk = 0\n").is_err());
  }

  #[test]
  fn missing_config_file_is_reported() {
    let err = Config::load(Path::new("/definitely/not/here.toml")).unwrap_err();
    assert!(matches!(
      err,
      StartupConfigError::MissingFile { what: "配置", .. }
    ));
  }
}
