// 该文件是 Tingjing （听境） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 推理后端
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! 三个后端共用 `onnx://<模型路径>?参数` 形式的地址：
//!
//! - 检测：`onnx:///models/yolov4-tiny.onnx?output=output0&transposed&pixel`
//! - 姿态：`onnx:///models/pose_landmark.onnx?size=256&output=Identity&presence=Identity_1`
//! - 人脸：`onnx:///models/face_landmark.onnx?size=192&output=output&landmarks=468`

use std::path::Path;

use image::imageops::{self, FilterType};
use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::Tensor,
};
use parking_lot::Mutex;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::StartupConfigError,
  frame::Frame,
  model::{
    BodyLandmarkSet, DetectorBackend, FaceLandmarkSet, FaceMeshExtractor, InferenceError,
    InputTensor, Landmark, PoseExtractor, RawCandidates,
    pose::BODY_LANDMARKS,
  },
  url_path,
};

const POSE_VALUES: usize = 5;
const FACE_VALUES: usize = 3;

fn query(url: &Url, key: &str) -> Option<String> {
  url
    .query_pairs()
    .find(|(k, _)| k == key)
    .map(|(_, v)| v.into_owned())
}

fn query_flag(url: &Url, key: &str) -> bool {
  url.query_pairs().any(|(k, v)| k == key && v != "false")
}

fn query_parse<T: std::str::FromStr>(
  url: &Url,
  key: &'static str,
  default: T,
) -> Result<T, StartupConfigError> {
  match query(url, key) {
    Some(value) => value.parse().map_err(|_| StartupConfigError::InvalidValue {
      field: key,
      reason: format!("无法解析 {}", value),
    }),
    None => Ok(default),
  }
}

fn backend_error(context: &str, e: impl std::fmt::Display) -> InferenceError {
  InferenceError::Backend(format!("{}: {}", context, e))
}

/// 一个 ONNX 会话与其输出名称
struct OnnxSession {
  session: Mutex<Session>,
  output: String,
  presence: Option<(String, f32)>,
}

impl OnnxSession {
  fn load(url: &Url, default_output: &str) -> Result<Self, StartupConfigError> {
    if url.scheme() != OnnxDetector::SCHEME {
      return Err(StartupConfigError::UnsupportedModel(url.to_string()));
    }

    let path = url_path(url);
    let bytes = std::fs::read(&path).map_err(|source| {
      if source.kind() == std::io::ErrorKind::NotFound {
        StartupConfigError::MissingFile {
          what: "模型",
          path: path.clone().into(),
        }
      } else {
        StartupConfigError::Io {
          path: path.clone().into(),
          source,
        }
      }
    })?;

    let session = Session::builder()
      .map_err(|e| StartupConfigError::ModelLoad(format!("创建会话失败: {}", e)))?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(|e| StartupConfigError::ModelLoad(format!("设置优化级别失败: {}", e)))?
      .commit_from_memory(&bytes)
      .map_err(|e| StartupConfigError::ModelLoad(format!("{}: {}", Path::new(&path).display(), e)))?;

    let output = query(url, "output").unwrap_or_else(|| default_output.to_string());
    let presence = match query(url, "presence") {
      Some(name) => Some((name, query_parse(url, "presence_threshold", 0.5f32)?)),
      None => None,
    };

    info!("加载 ONNX 模型: {}, 输出 {}", path, output);
    Ok(Self {
      session: Mutex::new(session),
      output,
      presence,
    })
  }

  /// 运行模型，返回主输出的形状和数据；有存在性输出且低于阈值时返回 `None`
  fn run(
    &self,
    shape: Vec<usize>,
    data: Vec<f32>,
  ) -> Result<Option<(Vec<i64>, Vec<f32>)>, InferenceError> {
    let tensor = Tensor::from_array((shape, data.into_boxed_slice()))
      .map_err(|e| backend_error("创建输入张量失败", e))?;

    let mut session = self.session.lock();
    let outputs = session
      .run(ort::inputs![tensor])
      .map_err(|e| backend_error("推理失败", e))?;

    if let Some((name, threshold)) = &self.presence {
      let value = outputs
        .get(name.as_str())
        .ok_or_else(|| InferenceError::MalformedOutput(format!("缺少输出 {}", name)))?;
      let (_, score) = value
        .try_extract_tensor::<f32>()
        .map_err(|e| InferenceError::MalformedOutput(e.to_string()))?;
      if score.first().is_none_or(|s| s <= threshold) {
        return Ok(None);
      }
    }

    let value = outputs
      .get(self.output.as_str())
      .ok_or_else(|| InferenceError::MalformedOutput(format!("缺少输出 {}", self.output)))?;
    let (shape, data) = value
      .try_extract_tensor::<f32>()
      .map_err(|e| InferenceError::MalformedOutput(e.to_string()))?;

    Ok(Some((shape.to_vec(), data.to_vec())))
  }
}

/// 关键点模型的图像输入：正方形，NHWC 或 NCHW，[0,1] 或 [-1,1]
struct ImageInput {
  size: u32,
  nchw: bool,
  signed: bool,
}

impl ImageInput {
  fn from_url(url: &Url, default_size: u32) -> Result<Self, StartupConfigError> {
    let size = query_parse(url, "size", default_size)?;
    if size == 0 {
      return Err(StartupConfigError::InvalidValue {
        field: "size",
        reason: "必须大于 0".to_string(),
      });
    }
    Ok(Self {
      size,
      nchw: query_flag(url, "nchw"),
      signed: query_flag(url, "signed"),
    })
  }

  fn tensor(&self, frame: &Frame) -> (Vec<usize>, Vec<f32>) {
    let resized = imageops::resize(
      &frame.to_rgb_image(),
      self.size,
      self.size,
      FilterType::Triangle,
    );
    let side = self.size as usize;
    let plane = side * side;
    let normalize = |v: u8| {
      let unit = v as f32 / 255.0;
      if self.signed { unit * 2.0 - 1.0 } else { unit }
    };

    let mut data = vec![0.0f32; 3 * plane];
    for (idx, pixel) in resized.pixels().enumerate() {
      for c in 0..3 {
        let at = if self.nchw { c * plane + idx } else { idx * 3 + c };
        data[at] = normalize(pixel[c]);
      }
    }

    let shape = if self.nchw {
      vec![1, 3, side, side]
    } else {
      vec![1, side, side, 3]
    };
    (shape, data)
  }
}

/// YOLO 类检测模型
pub struct OnnxDetector {
  session: OnnxSession,
  /// 输出为 `[1, stride, rows]` 时需要转置
  transposed: bool,
  /// 坐标是输入像素而非归一化值
  pixel: bool,
}

impl FromUrl for OnnxDetector {
  type Error = StartupConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    // 检测模型每帧都输出候选框，没有存在性分数
    if query(url, "presence").is_some() {
      return Err(StartupConfigError::InvalidValue {
        field: "presence",
        reason: "检测模型不支持存在性输出".to_string(),
      });
    }
    Ok(Self {
      session: OnnxSession::load(url, "output0")?,
      transposed: query_flag(url, "transposed"),
      pixel: query_flag(url, "pixel"),
    })
  }
}

impl FromUrlWithScheme for OnnxDetector {
  const SCHEME: &'static str = "onnx";
}

impl DetectorBackend for OnnxDetector {
  fn forward(&self, input: &InputTensor) -> Result<RawCandidates, InferenceError> {
    let [n, c, h, w] = input.shape();
    let (shape, mut data) = self
      .session
      .run(vec![n, c, h, w], input.data().to_vec())?
      .ok_or_else(|| InferenceError::MalformedOutput("检测模型不应有存在性输出".to_string()))?;

    let dims = shape
      .iter()
      .filter(|&&d| d != 1)
      .map(|&d| d as usize)
      .collect::<Vec<_>>();
    let (rows, stride) = match dims.as_slice() {
      [a, b] if self.transposed => (*b, *a),
      [a, b] => (*a, *b),
      _ => {
        return Err(InferenceError::MalformedOutput(format!(
          "无法识别的输出形状 {:?}",
          shape
        )));
      }
    };

    if self.transposed {
      let mut out = vec![0.0f32; data.len()];
      for r in 0..rows {
        for s in 0..stride {
          out[r * stride + s] = data[s * rows + r];
        }
      }
      data = out;
    }

    if self.pixel {
      for row in data.chunks_exact_mut(stride) {
        for (i, v) in row.iter_mut().take(4).enumerate() {
          *v /= if i % 2 == 0 { w as f32 } else { h as f32 };
        }
      }
    }

    RawCandidates::new(data, stride)
  }
}

/// BlazePose 类关键点模型，输出 `[1, N×5]`，取前 33 个点
pub struct OnnxPoseExtractor {
  session: OnnxSession,
  input: ImageInput,
}

impl FromUrl for OnnxPoseExtractor {
  type Error = StartupConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    Ok(Self {
      session: OnnxSession::load(url, "Identity")?,
      input: ImageInput::from_url(url, 256)?,
    })
  }
}

impl FromUrlWithScheme for OnnxPoseExtractor {
  const SCHEME: &'static str = "onnx";
}

fn sigmoid(v: f32) -> f32 {
  1.0 / (1.0 + (-v).exp())
}

impl PoseExtractor for OnnxPoseExtractor {
  fn extract(&self, frame: &Frame) -> Result<Option<BodyLandmarkSet>, InferenceError> {
    let (shape, data) = self.input.tensor(frame);
    let Some((_, output)) = self.session.run(shape, data)? else {
      return Ok(None);
    };

    if output.len() < BODY_LANDMARKS * POSE_VALUES {
      return Err(InferenceError::MalformedOutput(format!(
        "姿态输出长度 {} 小于 {}",
        output.len(),
        BODY_LANDMARKS * POSE_VALUES
      )));
    }

    let size = self.input.size as f32;
    let landmarks = output
      .chunks_exact(POSE_VALUES)
      .take(BODY_LANDMARKS)
      .map(|v| Landmark {
        x: v[0] / size,
        y: v[1] / size,
        z: v[2] / size,
        visibility: sigmoid(v[3]),
      })
      .collect();

    Ok(Some(BodyLandmarkSet::new(landmarks)))
  }
}

/// 人脸网格模型，输出 `[1, N, 3]` 或 `[1, N×3]`
pub struct OnnxFaceMesh {
  session: OnnxSession,
  input: ImageInput,
  landmarks: usize,
}

impl FromUrl for OnnxFaceMesh {
  type Error = StartupConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    Ok(Self {
      session: OnnxSession::load(url, "output")?,
      input: ImageInput::from_url(url, 192)?,
      landmarks: query_parse(url, "landmarks", 468usize)?,
    })
  }
}

impl FromUrlWithScheme for OnnxFaceMesh {
  const SCHEME: &'static str = "onnx";
}

impl FaceMeshExtractor for OnnxFaceMesh {
  fn landmark_count(&self) -> usize {
    self.landmarks
  }

  fn extract(&self, frame: &Frame) -> Result<Option<FaceLandmarkSet>, InferenceError> {
    let (shape, data) = self.input.tensor(frame);
    let Some((_, output)) = self.session.run(shape, data)? else {
      return Ok(None);
    };

    if output.len() != self.landmarks * FACE_VALUES {
      return Err(InferenceError::MalformedOutput(format!(
        "人脸网格输出长度 {}, 期望 {}",
        output.len(),
        self.landmarks * FACE_VALUES
      )));
    }

    let size = self.input.size as f32;
    let points = output
      .chunks_exact(FACE_VALUES)
      .map(|v| (v[0] / size, v[1] / size))
      .collect();

    Ok(Some(FaceLandmarkSet::new(points)))
  }
}
