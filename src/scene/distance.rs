// 该文件是 Tingjing （听境） 项目的一部分。
// src/scene/distance.rs - 针孔模型距离估计
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::collections::HashMap;

use crate::{config::DistanceConfig, model::Detection};

/// `distance = real_width × focal_length / pixel_width`
#[derive(Debug, Clone)]
pub struct DistanceEstimator {
  focal_length: f32,
  reference_widths: HashMap<String, f32>,
}

impl DistanceEstimator {
  pub fn new(config: &DistanceConfig) -> Self {
    Self {
      focal_length: config.focal_length,
      reference_widths: config.reference_widths.clone(),
    }
  }

  /// 没有配置参考宽度的类别不估计
  pub fn estimate(&self, detection: &Detection) -> Option<f32> {
    let real_width = *self.reference_widths.get(&detection.label)?;
    let pixel_width = detection.bbox.width;
    if pixel_width <= 0.0 {
      return None;
    }
    Some(real_width * self.focal_length / pixel_width)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::BBox;

  fn person(width: f32) -> Detection {
    Detection {
      label: "person".to_string(),
      confidence: 0.9,
      bbox: BBox {
        x: 0.0,
        y: 0.0,
        width,
        height: 10.0,
      },
    }
  }

  #[test]
  fn pinhole_relation() {
    let config = DistanceConfig {
      focal_length: 650.0,
      reference_widths: [("person".to_string(), 45.0)].into(),
    };
    let estimator = DistanceEstimator::new(&config);
    let distance = estimator.estimate(&person(130.0)).unwrap();
    assert!((distance - 225.0).abs() < 1e-3);
  }

  #[test]
  fn unknown_label_has_no_distance() {
    let estimator = DistanceEstimator::new(&DistanceConfig::default());
    assert_eq!(estimator.estimate(&person(130.0)), None);
  }
}
