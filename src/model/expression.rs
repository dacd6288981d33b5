// 该文件是 Tingjing （听境） 项目的一部分。
// src/model/expression.rs - 人脸网格与表情分类
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{collections::BTreeMap, fmt, path::Path};

use serde::{Serialize, Serializer};
use tracing::info;

use crate::{
  config::{StartupConfigError, read_required},
  frame::Frame,
  model::{InferenceError, Model},
};

/// 单张人脸的归一化网格坐标
#[derive(Debug, Clone, PartialEq)]
pub struct FaceLandmarkSet {
  points: Vec<(f32, f32)>,
}

impl FaceLandmarkSet {
  pub fn new(points: Vec<(f32, f32)>) -> Self {
    Self { points }
  }

  pub fn len(&self) -> usize {
    self.points.len()
  }

  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
  }

  /// 按 `x0, y0, x1, y1, ...` 展开
  pub fn features(&self) -> Vec<f32> {
    self.points.iter().flat_map(|&(x, y)| [x, y]).collect()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpressionLabel {
  Label(String),
  Undetermined,
}

impl ExpressionLabel {
  pub fn as_str(&self) -> &str {
    match self {
      ExpressionLabel::Label(label) => label,
      ExpressionLabel::Undetermined => "Undetermined",
    }
  }
}

impl fmt::Display for ExpressionLabel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl Serialize for ExpressionLabel {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

/// 人脸网格提取黑盒，每帧至多一张脸
pub trait FaceMeshExtractor: Send + Sync {
  /// 每张脸输出的关键点数量
  fn landmark_count(&self) -> usize;

  fn extract(&self, frame: &Frame) -> Result<Option<FaceLandmarkSet>, InferenceError>;
}

/// 带标签的参考特征
#[derive(Debug, Clone)]
pub struct ReferenceSet {
  features: Vec<f32>,
  labels: Vec<String>,
  width: usize,
}

impl ReferenceSet {
  pub fn from_csv(path: &Path, has_header: bool) -> Result<Self, StartupConfigError> {
    let content = read_required("表情数据集", path)?;
    let set = Self::parse(&content, path, has_header)?;
    info!(
      "加载表情数据集 {}: {} 行, 特征宽度 {}",
      path.display(),
      set.len(),
      set.width()
    );
    Ok(set)
  }

  /// 最后一列是标签
  ///
  /// `has_header` 时首个非空行无论内容如何都是表头，其列数约束后面的每一行。
  pub fn parse(content: &str, path: &Path, has_header: bool) -> Result<Self, StartupConfigError> {
    let dataset_error = |line: usize, reason: String| StartupConfigError::Dataset {
      path: path.to_path_buf(),
      line,
      reason,
    };

    let mut features = Vec::new();
    let mut labels = Vec::new();
    let mut columns = None;
    let mut header = has_header;

    for (index, line) in content.lines().enumerate() {
      let line_no = index + 1;
      let line = line.trim();
      if line.is_empty() {
        continue;
      }

      let cells = line.split(',').map(str::trim).collect::<Vec<_>>();
      if std::mem::take(&mut header) {
        if cells.len() < 2 {
          return Err(dataset_error(line_no, "表头至少需要两列".to_string()));
        }
        columns = Some(cells.len());
        continue;
      }
      if cells.len() < 2 {
        return Err(dataset_error(line_no, "至少需要一列特征和一列标签".to_string()));
      }
      let (values, label) = cells.split_at(cells.len() - 1);

      let expected = *columns.get_or_insert(cells.len());
      if cells.len() != expected {
        return Err(dataset_error(
          line_no,
          format!("列数为 {}, 前面的行为 {}", cells.len(), expected),
        ));
      }

      let parsed = values
        .iter()
        .map(|cell| cell.parse::<f32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| dataset_error(line_no, format!("特征无法解析: {}", e)))?;
      if parsed.iter().any(|v| !v.is_finite()) {
        return Err(dataset_error(line_no, "特征包含非有限值".to_string()));
      }
      if label[0].is_empty() {
        return Err(dataset_error(line_no, "标签为空".to_string()));
      }

      features.extend(parsed);
      labels.push(label[0].to_string());
    }

    let (Some(columns), false) = (columns, labels.is_empty()) else {
      return Err(dataset_error(1, "数据集没有任何样本".to_string()));
    };

    Ok(Self {
      features,
      labels,
      width: columns - 1,
    })
  }

  pub fn from_rows<L: Into<String>>(rows: Vec<(Vec<f32>, L)>) -> Option<Self> {
    let width = rows.first()?.0.len();
    let mut features = Vec::with_capacity(width * rows.len());
    let mut labels = Vec::with_capacity(rows.len());
    for (row, label) in rows {
      if row.len() != width {
        return None;
      }
      features.extend(row);
      labels.push(label.into());
    }
    Some(Self {
      features,
      labels,
      width,
    })
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn width(&self) -> usize {
    self.width
  }

  fn row(&self, index: usize) -> &[f32] {
    &self.features[index * self.width..(index + 1) * self.width]
  }
}

/// k 近邻分类器，欧氏距离，多数表决
///
/// 票数相同时取距离之和较小的标签，再相同时取字典序较小的标签。
#[derive(Debug, Clone)]
pub struct KnnClassifier {
  reference: ReferenceSet,
  k: usize,
}

impl KnnClassifier {
  pub fn new(reference: ReferenceSet, k: usize) -> Result<Self, StartupConfigError> {
    if k == 0 || k > reference.len() {
      return Err(StartupConfigError::InvalidValue {
        field: "expression.k",
        reason: format!("k = {} 不在 [1, {}] 范围内", k, reference.len()),
      });
    }
    Ok(Self { reference, k })
  }

  pub fn width(&self) -> usize {
    self.reference.width()
  }

  pub fn classify(&self, features: &[f32]) -> Result<String, InferenceError> {
    if features.len() != self.width() {
      return Err(InferenceError::FeatureMismatch {
        expected: self.width(),
        actual: features.len(),
      });
    }

    let mut neighbours = (0..self.reference.len())
      .map(|index| {
        let distance = self
          .reference
          .row(index)
          .iter()
          .zip(features)
          .map(|(a, b)| {
            let d = (*a - *b) as f64;
            d * d
          })
          .sum::<f64>()
          .sqrt();
        (distance, index)
      })
      .collect::<Vec<_>>();
    neighbours.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut votes: BTreeMap<&str, (usize, f64)> = BTreeMap::new();
    for &(distance, index) in neighbours.iter().take(self.k) {
      let vote = votes.entry(&self.reference.labels[index]).or_insert((0, 0.0));
      vote.0 += 1;
      vote.1 += distance;
    }

    // BTreeMap 按字典序遍历，min_by 在相等时保留第一个
    votes
      .into_iter()
      .min_by(|(_, a), (_, b)| b.0.cmp(&a.0).then(a.1.total_cmp(&b.1)))
      .map(|(label, _)| label.to_string())
      .ok_or_else(|| InferenceError::Backend("参考数据集为空".to_string()))
  }
}

/// 表情阶段；没有提取器时每帧都是 `Undetermined`
pub struct ExpressionStage {
  inner: Option<(Box<dyn FaceMeshExtractor>, KnnClassifier)>,
}

impl ExpressionStage {
  /// 实时特征宽度必须与参考数据一致，否则在启动时失败
  pub fn new(
    extractor: Box<dyn FaceMeshExtractor>,
    classifier: KnnClassifier,
    landmark_count: usize,
  ) -> Result<Self, StartupConfigError> {
    let live = 2 * extractor.landmark_count();
    if extractor.landmark_count() != landmark_count || classifier.width() != live {
      return Err(StartupConfigError::FeatureWidth {
        reference: classifier.width(),
        live,
      });
    }
    Ok(Self {
      inner: Some((extractor, classifier)),
    })
  }

  pub fn disabled() -> Self {
    Self { inner: None }
  }
}

impl Model for ExpressionStage {
  type Input = Frame;
  type Output = ExpressionLabel;
  type Error = InferenceError;

  fn infer(&self, frame: &Frame) -> Result<ExpressionLabel, InferenceError> {
    let Some((extractor, classifier)) = &self.inner else {
      return Ok(ExpressionLabel::Undetermined);
    };

    match extractor.extract(frame)? {
      Some(face) => classifier.classify(&face.features()).map(ExpressionLabel::Label),
      None => Ok(ExpressionLabel::Undetermined),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use super::*;
  use crate::frame::ChannelOrder;

  fn reference() -> ReferenceSet {
    ReferenceSet::from_rows(vec![
      (vec![0.0, 0.0], "neutral"),
      (vec![0.1, 0.0], "neutral"),
      (vec![1.0, 1.0], "happy"),
      (vec![1.1, 1.0], "happy"),
      (vec![0.9, 1.0], "happy"),
    ])
    .unwrap()
  }

  #[test]
  fn majority_of_three_nearest_wins() {
    let knn = KnnClassifier::new(reference(), 3).unwrap();
    assert_eq!(knn.classify(&[0.05, 0.0]).unwrap(), "neutral");
    assert_eq!(knn.classify(&[1.0, 0.9]).unwrap(), "happy");
  }

  #[test]
  fn vote_tie_goes_to_smaller_total_distance() {
    let set = ReferenceSet::from_rows(vec![
      (vec![0.0], "a"),
      (vec![3.0], "b"),
      (vec![10.0], "c"),
    ])
    .unwrap();
    let knn = KnnClassifier::new(set, 3).unwrap();
    assert_eq!(knn.classify(&[2.0]).unwrap(), "b");
  }

  #[test]
  fn full_tie_goes_to_first_label() {
    let set = ReferenceSet::from_rows(vec![(vec![-1.0], "right"), (vec![1.0], "left")]).unwrap();
    let knn = KnnClassifier::new(set, 2).unwrap();
    assert_eq!(knn.classify(&[0.0]).unwrap(), "left");
  }

  #[test]
  fn wrong_width_is_feature_mismatch() {
    let knn = KnnClassifier::new(reference(), 3).unwrap();
    assert!(matches!(
      knn.classify(&[0.0, 0.0, 0.0]),
      Err(InferenceError::FeatureMismatch {
        expected: 2,
        actual: 3
      })
    ));
  }

  #[test]
  fn k_larger_than_dataset_is_rejected() {
    assert!(KnnClassifier::new(reference(), 6).is_err());
    assert!(KnnClassifier::new(reference(), 0).is_err());
  }

  #[test]
  fn csv_with_header_is_parsed() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "x0,y0,label").unwrap();
    writeln!(file, "0.1,0.2,happy").unwrap();
    writeln!(file).unwrap();
    writeln!(file, "0.3,0.4,sad").unwrap();
    let set = ReferenceSet::from_csv(file.path(), true).unwrap();
    assert_eq!(set.len(), 2);
    assert_eq!(set.width(), 2);
  }

  #[test]
  fn ragged_csv_reports_line() {
    let err = ReferenceSet::parse("0.1,0.2,happy\n0.3,sad\n", Path::new("d.csv"), false).unwrap_err();
    assert!(matches!(err, StartupConfigError::Dataset { line: 2, .. }));
  }

  #[test]
  fn bad_number_after_first_row_is_rejected() {
    let err = ReferenceSet::parse("0.1,0.2,happy\n0.3,oops,sad\n", Path::new("d.csv"), false).unwrap_err();
    assert!(matches!(err, StartupConfigError::Dataset { line: 2, .. }));
  }

  #[test]
  fn header_only_csv_is_rejected() {
    assert!(ReferenceSet::parse("x,y,label\n", Path::new("d.csv"), true).is_err());
  }

  #[test]
  fn numeric_header_is_not_a_sample() {
    let content = "0,1,2\n0.1,0.2,happy\n0.3,0.4,sad\n";
    let set = ReferenceSet::parse(content, Path::new("d.csv"), true).unwrap();
    assert_eq!(set.len(), 2);
    assert_eq!(set.width(), 2);

    let headerless = ReferenceSet::parse(content, Path::new("d.csv"), false).unwrap();
    assert_eq!(headerless.len(), 3);
  }

  #[test]
  fn row_wider_than_header_is_rejected() {
    let err = ReferenceSet::parse("x,label\n0.1,0.2,happy\n", Path::new("d.csv"), true).unwrap_err();
    assert!(matches!(err, StartupConfigError::Dataset { line: 2, .. }));
  }

  #[test]
  fn missing_dataset_is_startup_error() {
    let err = ReferenceSet::from_csv(Path::new("/no/such/faces.csv"), true).unwrap_err();
    assert!(matches!(err, StartupConfigError::MissingFile { .. }));
  }

  struct FixedFace(usize, Option<FaceLandmarkSet>);

  impl FaceMeshExtractor for FixedFace {
    fn landmark_count(&self) -> usize {
      self.0
    }

    fn extract(&self, _frame: &Frame) -> Result<Option<FaceLandmarkSet>, InferenceError> {
      Ok(self.1.clone())
    }
  }

  #[test]
  fn width_mismatch_fails_at_construction() {
    let knn = KnnClassifier::new(reference(), 3).unwrap();
    let err = ExpressionStage::new(Box::new(FixedFace(468, None)), knn, 468).err();
    assert!(matches!(
      err,
      Some(StartupConfigError::FeatureWidth {
        reference: 2,
        live: 936
      })
    ));
  }

  #[test]
  fn stage_classifies_single_face() {
    let frame = Frame::from_raw(1, 1, ChannelOrder::Rgb, 0, vec![0, 0, 0]).unwrap();
    let knn = KnnClassifier::new(reference(), 3).unwrap();
    let face = FaceLandmarkSet::new(vec![(1.0, 1.0)]);
    let stage = ExpressionStage::new(Box::new(FixedFace(1, Some(face))), knn, 1).unwrap();
    assert_eq!(
      stage.infer(&frame).unwrap(),
      ExpressionLabel::Label("happy".to_string())
    );

    let knn = KnnClassifier::new(reference(), 3).unwrap();
    let stage = ExpressionStage::new(Box::new(FixedFace(1, None)), knn, 1).unwrap();
    assert_eq!(stage.infer(&frame).unwrap(), ExpressionLabel::Undetermined);
  }

  #[test]
  fn label_serializes_as_plain_string() {
    let json = serde_json::to_string(&ExpressionLabel::Undetermined).unwrap();
    assert_eq!(json, "\"Undetermined\"");
  }
}
