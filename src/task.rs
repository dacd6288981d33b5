// 该文件是 Tingjing （听境） 项目的一部分。
// src/task.rs - 任务与帧循环
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

use std::{
  io::BufRead,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  audio::{AudioSink, AudioSinkError, CancelToken, SpeechWorker},
  config::{Config, StartupConfigError},
  frame::Frame,
  input::{CaptureError, CaptureSession, FrameSource},
  model::{
    DetectionStage, Detection, ExpressionLabel, ExpressionStage, GestureState, InferenceError,
    KnnClassifier, Labels, Model, PoseResult, PoseStage, ReferenceSet, detector_from_url,
    face_mesh_from_url, pose_extractor_from_url,
  },
  output::Render,
  scene::{SceneDescription, StableState, Synthesizer},
};

#[derive(Error, Debug)]
pub enum TaskError {
  #[error("推理后端故障: {0}")]
  Inference(#[from] InferenceError),
  #[error("输入错误: {0}")]
  Capture(#[from] CaptureError),
  #[error("没有输入帧")]
  NoFrame,
  #[error("输出错误: {0}")]
  Output(String),
  #[error("语音线程启动失败: {0}")]
  Audio(#[from] AudioSinkError),
  #[error("中断信号处理器安装失败: {0}")]
  Signal(#[from] ctrlc::Error),
}

#[derive(Debug, Default)]
struct StopState {
  raised: AtomicBool,
  linked: Mutex<Vec<CancelToken>>,
}

/// 外部停止信号
///
/// 帧循环在两帧之间检查；关联的播报在触发时立即取消，不等帧循环醒来。
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<StopState>);

impl StopSignal {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn raise(&self) {
    self.0.raised.store(true, Ordering::SeqCst);
    for token in self.0.linked.lock().iter() {
      token.cancel();
    }
  }

  pub fn is_raised(&self) -> bool {
    self.0.raised.load(Ordering::SeqCst)
  }

  /// 已经触发过时立即取消
  pub fn link(&self, token: CancelToken) {
    let mut linked = self.0.linked.lock();
    if self.is_raised() {
      token.cancel();
    }
    linked.push(token);
  }

  /// Ctrl-C 触发停止；每个进程只能安装一次
  pub fn install_ctrlc(&self) -> Result<(), TaskError> {
    let signal = self.clone();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      signal.raise();
    })?;
    Ok(())
  }

  /// 标准输入读到 `q` 时触发停止
  pub fn watch_stdin(&self) {
    let signal = self.clone();
    let spawned = thread::Builder::new()
      .name("stdin-quit".to_string())
      .spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
          match line {
            Ok(line) if line.trim() == "q" => {
              info!("收到退出指令");
              signal.raise();
              break;
            }
            Ok(_) => {}
            Err(_) => break,
          }
        }
      });
    if let Err(e) = spawned {
      warn!("无法监听标准输入: {}", e);
    }
  }
}

/// 一帧的三个阶段输出，融合之前
#[derive(Debug, Clone)]
pub struct FrameAnalysis {
  pub detections: Vec<Detection>,
  pub pose: PoseResult,
  pub expression: ExpressionLabel,
}

/// 检测、姿态、表情三个阶段与融合
///
/// 检测失败向上传递；姿态和表情失败降级为 `Undetermined`。
pub struct Pipeline {
  detection: DetectionStage,
  pose: PoseStage,
  expression: ExpressionStage,
  synthesizer: Synthesizer,
  deadline: Option<Duration>,
  parallel: bool,
}

impl Pipeline {
  pub fn new(
    detection: DetectionStage,
    pose: PoseStage,
    expression: ExpressionStage,
    synthesizer: Synthesizer,
  ) -> Self {
    Self {
      detection,
      pose,
      expression,
      synthesizer,
      deadline: None,
      parallel: false,
    }
  }

  pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
    self.deadline = deadline;
    self
  }

  pub fn with_parallel_stages(mut self, parallel: bool) -> Self {
    self.parallel = parallel;
    self
  }

  /// 启动校验：标签、模型、数据集都在进入循环之前加载
  pub fn from_config(
    config: &Config,
    detector: &Url,
    pose: Option<&Url>,
    face: Option<&Url>,
  ) -> Result<Self, StartupConfigError> {
    config.validate()?;

    let labels = Labels::from_file(&config.detection.labels)?;
    let detection = DetectionStage::new(detector_from_url(detector)?, labels, &config.detection);

    let pose = match pose {
      Some(url) => PoseStage::new(
        Some(pose_extractor_from_url(url)?),
        config.pose.min_visibility,
      ),
      None => {
        info!("未配置姿态模型，手势始终为 Undetermined");
        PoseStage::new(None, config.pose.min_visibility)
      }
    };

    let expression = match face {
      Some(url) => {
        let extractor = face_mesh_from_url(url)?;
        let reference = ReferenceSet::from_csv(&config.expression.dataset, config.expression.has_header)?;
        let classifier = KnnClassifier::new(reference, config.expression.k)?;
        ExpressionStage::new(extractor, classifier, config.expression.landmark_count)?
      }
      None => {
        info!("未配置人脸模型，表情始终为 Undetermined");
        ExpressionStage::disabled()
      }
    };

    Ok(
      Self::new(
        detection,
        pose,
        expression,
        Synthesizer::new(&config.distance),
      )
      .with_deadline(config.pipeline.stage_deadline_ms.map(Duration::from_millis))
      .with_parallel_stages(config.pipeline.parallel_stages),
    )
  }

  pub fn synthesizer(&self) -> &Synthesizer {
    &self.synthesizer
  }

  /// 超过期限的结果视为丢弃
  fn timed<T>(
    &self,
    stage: &str,
    run: impl FnOnce() -> Result<T, InferenceError>,
  ) -> Result<T, InferenceError> {
    let started = Instant::now();
    let result = run()?;
    let elapsed = started.elapsed();
    debug!("{}阶段耗时 {:.2?}", stage, elapsed);
    match self.deadline {
      Some(deadline) if elapsed > deadline => {
        Err(InferenceError::DeadlineExceeded { elapsed, deadline })
      }
      _ => Ok(result),
    }
  }

  fn run_detection(&self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
    self.timed("检测", || self.detection.infer(frame))
  }

  fn run_pose(&self, frame: &Frame) -> PoseResult {
    self
      .timed("姿态", || self.pose.infer(frame))
      .unwrap_or_else(|e| {
        warn!("帧 {} 姿态阶段降级: {}", frame.sequence(), e);
        PoseResult::undetermined()
      })
  }

  fn run_expression(&self, frame: &Frame) -> ExpressionLabel {
    self
      .timed("表情", || self.expression.infer(frame))
      .unwrap_or_else(|e| {
        warn!("帧 {} 表情阶段降级: {}", frame.sequence(), e);
        ExpressionLabel::Undetermined
      })
  }

  pub fn analyze(&self, frame: &Frame) -> Result<FrameAnalysis, InferenceError> {
    if !self.parallel {
      let detections = self.run_detection(frame)?;
      return Ok(FrameAnalysis {
        detections,
        pose: self.run_pose(frame),
        expression: self.run_expression(frame),
      });
    }

    thread::scope(|scope| {
      let pose = scope.spawn(|| self.run_pose(frame));
      let expression = scope.spawn(|| self.run_expression(frame));
      let detections = self.run_detection(frame);

      let pose = pose.join().unwrap_or_else(|_| {
        warn!("姿态线程异常");
        PoseResult::undetermined()
      });
      let expression = expression.join().unwrap_or_else(|_| {
        warn!("表情线程异常");
        ExpressionLabel::Undetermined
      });

      detections.map(|detections| FrameAnalysis {
        detections,
        pose,
        expression,
      })
    })
  }

  pub fn fuse(
    &self,
    frame: &Frame,
    analysis: FrameAnalysis,
    gesture: GestureState,
  ) -> SceneDescription {
    self
      .synthesizer
      .fuse(frame, analysis.detections, gesture, analysis.expression)
  }

  /// 不做时间滤波的单帧处理
  pub fn process(&self, frame: &Frame) -> Result<SceneDescription, InferenceError> {
    let analysis = self.analyze(frame)?;
    let gesture = analysis.pose.gesture;
    Ok(self.fuse(frame, analysis, gesture))
  }
}

pub trait Task<S, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, source: S, pipeline: &Pipeline, output: O) -> Result<Self::Output, Self::Error>;
}

/// 只处理第一帧，返回其场景描述
pub struct OneShotTask;

impl<S, O> Task<S, O> for OneShotTask
where
  S: FrameSource,
  O: Render,
  O::Error: std::fmt::Display,
{
  type Output = SceneDescription;
  type Error = TaskError;

  fn run_task(self, source: S, pipeline: &Pipeline, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let mut session = CaptureSession::new(source);
    let frame = session.next_frame()?.ok_or(TaskError::NoFrame)?;
    session.release();

    info!("输入帧获取成功，开始推理...");
    let now = Instant::now();
    let scene = pipeline.process(&frame)?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());

    output
      .render_result(&frame, &scene)
      .map_err(|e| TaskError::Output(e.to_string()))?;
    Ok(scene)
  }
}

/// 帧循环结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
  EndOfStream,
  Stopped,
  FrameLimit,
  CaptureFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
  pub frames_processed: usize,
  pub frames_dropped: usize,
  pub exit: LoopExit,
}

/// 持续处理直到流结束、停止信号、达到帧数或采集失败
pub struct ContinuousTask {
  frame_number: Option<usize>,
  hold_frames: usize,
  stop: StopSignal,
  audio: Option<Box<dyn AudioSink>>,
}

impl ContinuousTask {
  pub fn new(stop: StopSignal) -> Self {
    Self {
      frame_number: None,
      hold_frames: 1,
      stop,
      audio: None,
    }
  }

  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_hold_frames(mut self, hold_frames: usize) -> Self {
    self.hold_frames = hold_frames;
    self
  }

  pub fn with_audio(mut self, sink: Box<dyn AudioSink>) -> Self {
    self.audio = Some(sink);
    self
  }
}

impl<S, O> Task<S, O> for ContinuousTask
where
  S: FrameSource,
  O: Render,
  O::Error: std::fmt::Display,
{
  type Output = RunSummary;
  type Error = TaskError;

  fn run_task(self, source: S, pipeline: &Pipeline, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let mut session = CaptureSession::new(source);
    let mut speech = match self.audio {
      Some(sink) => Some(SpeechWorker::spawn(sink)?),
      None => None,
    };
    if let Some(worker) = &speech {
      self.stop.link(worker.cancel_token());
    }
    let mut gesture = StableState::new(GestureState::Undetermined, self.hold_frames);

    let mut frames_read = 0usize;
    let mut frames_processed = 0usize;
    let mut frames_dropped = 0usize;

    let exit = loop {
      if self.stop.is_raised() {
        warn!("中断信号接收，退出任务循环");
        break LoopExit::Stopped;
      }
      if self.frame_number.is_some_and(|n| frames_read >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frames_read);
        break LoopExit::FrameLimit;
      }

      let frame = match session.next_frame() {
        Ok(Some(frame)) => frame,
        Ok(None) => {
          info!("输入结束");
          break LoopExit::EndOfStream;
        }
        Err(e) => {
          error!("采集失败，退出任务循环: {}", e);
          break LoopExit::CaptureFailed;
        }
      };
      frames_read += 1;

      let now = Instant::now();
      let analysis = match pipeline.analyze(&frame) {
        Ok(analysis) => analysis,
        Err(e) if e.is_recoverable() => {
          warn!("丢弃第 {} 帧: {}", frame.sequence(), e);
          frames_dropped += 1;
          continue;
        }
        Err(e) => {
          error!("推理后端故障，终止任务: {}", e);
          return Err(e.into());
        }
      };
      let elapsed_a = now.elapsed();

      let stable = *gesture.update(analysis.pose.gesture);
      let scene = pipeline.fuse(&frame, analysis, stable);

      if let Some(worker) = &speech {
        worker.submit(&scene.summary_text);
      }
      if let Err(e) = output.render_result(&frame, &scene) {
        warn!("渲染第 {} 帧失败: {}", frame.sequence(), e);
      }
      let elapsed_b = now.elapsed();

      frames_processed += 1;
      info!(
        "处理第 {} 帧: {} 个目标, 耗时 {:.2?} / {:.2?}",
        frame.sequence(),
        scene.detections.len(),
        elapsed_a,
        elapsed_b
      );
    };

    session.release();
    if let Some(worker) = speech.as_mut() {
      worker.shutdown();
    }

    info!(
      "任务完成: 处理 {} 帧, 丢弃 {} 帧",
      frames_processed, frames_dropped
    );
    Ok(RunSummary {
      frames_processed,
      frames_dropped,
      exit,
    })
  }
}
