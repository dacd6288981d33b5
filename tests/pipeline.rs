// 帧循环的端到端场景，用假的帧来源和模型后端

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
    mpsc,
  },
  thread,
  time::{Duration, Instant},
};

use parking_lot::Mutex;

use tingjing::{
  audio::{AudioSink, AudioSinkError, CancelToken},
  config::{CandidateLayout, Config, DetectionConfig, StartupConfigError},
  frame::{ChannelOrder, Frame},
  input::{CaptureError, FrameSource},
  model::{
    BodyLandmarkSet, DetectionStage, DetectorBackend, ExpressionStage, GestureState,
    InferenceError, InputTensor, LEFT_WRIST, Labels, Landmark, NOSE, PoseExtractor, PoseStage,
    RIGHT_WRIST, RawCandidates,
  },
  output::Render,
  scene::{SceneDescription, Synthesizer},
  task::{ContinuousTask, LoopExit, OneShotTask, Pipeline, StopSignal, Task, TaskError},
};

const WIDTH: u32 = 900;
const HEIGHT: u32 = 300;

fn frame(sequence: u64) -> Frame {
  let data = vec![64u8; (WIDTH * HEIGHT * 3) as usize];
  Frame::from_raw(WIDTH, HEIGHT, ChannelOrder::Rgb, sequence, data).unwrap()
}

/// 按脚本依次返回帧或错误，并记录读取与释放
#[derive(Clone, Default)]
struct ScriptedSource {
  script: Arc<Mutex<Vec<Result<Frame, String>>>>,
  reads: Arc<AtomicUsize>,
  released: Arc<AtomicBool>,
}

impl ScriptedSource {
  fn frames(count: u64) -> Self {
    Self::with_script((0..count).map(|i| Ok(frame(i))).collect())
  }

  fn with_script(mut script: Vec<Result<Frame, String>>) -> Self {
    script.reverse();
    Self {
      script: Arc::new(Mutex::new(script)),
      ..Default::default()
    }
  }
}

impl FrameSource for ScriptedSource {
  fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
    self.reads.fetch_add(1, Ordering::SeqCst);
    match self.script.lock().pop() {
      Some(Ok(frame)) => Ok(Some(frame)),
      Some(Err(reason)) => Err(CaptureError::Device(reason)),
      None => Ok(None),
    }
  }

  fn release(&mut self) {
    self.released.store(true, Ordering::SeqCst);
  }
}

#[derive(Clone)]
enum BackendMode {
  Rows(Vec<Vec<f32>>),
  Ragged,
  Broken,
  Slow(Duration),
}

struct FakeDetector(BackendMode);

impl DetectorBackend for FakeDetector {
  fn forward(&self, _input: &InputTensor) -> Result<RawCandidates, InferenceError> {
    match &self.0 {
      BackendMode::Rows(rows) => RawCandidates::new(rows.concat(), 6),
      BackendMode::Ragged => RawCandidates::new(vec![0.5; 7], 6),
      BackendMode::Broken => Err(InferenceError::Backend("npu lost".to_string())),
      BackendMode::Slow(delay) => {
        std::thread::sleep(*delay);
        RawCandidates::new(Vec::new(), 6)
      }
    }
  }
}

fn row(cx: f32, w: f32, person: f32, chair: f32) -> Vec<f32> {
  vec![cx / WIDTH as f32, 0.5, w / WIDTH as f32, 0.2, person, chair]
}

fn person_and_chair() -> BackendMode {
  BackendMode::Rows(vec![row(140.0, 80.0, 0.9, 0.05), row(730.0, 60.0, 0.1, 0.7)])
}

fn detection_stage(mode: BackendMode) -> DetectionStage {
  let labels: Labels = ["person", "chair"].into_iter().collect();
  let config = DetectionConfig {
    layout: CandidateLayout::Plain,
    target_size: 32,
    ..Default::default()
  };
  DetectionStage::new(Box::new(FakeDetector(mode)), labels, &config)
}

/// 依次返回手腕高于或低于鼻子的人体
struct ScriptedPose {
  raised: Mutex<Vec<bool>>,
}

impl PoseExtractor for ScriptedPose {
  fn extract(&self, _frame: &Frame) -> Result<Option<BodyLandmarkSet>, InferenceError> {
    let Some(raised) = self.raised.lock().pop() else {
      return Ok(None);
    };
    let wrist_y = if raised { 0.1 } else { 0.9 };
    let mut points = vec![
      Landmark {
        x: 0.5,
        y: 0.5,
        z: 0.0,
        visibility: 0.0,
      };
      33
    ];
    for (index, y) in [(NOSE, 0.4), (LEFT_WRIST, wrist_y), (RIGHT_WRIST, wrist_y)] {
      points[index] = Landmark {
        x: 0.5,
        y,
        z: 0.0,
        visibility: 0.99,
      };
    }
    Ok(Some(BodyLandmarkSet::new(points)))
  }
}

struct FailingPose;

impl PoseExtractor for FailingPose {
  fn extract(&self, _frame: &Frame) -> Result<Option<BodyLandmarkSet>, InferenceError> {
    Err(InferenceError::MalformedOutput("empty tensor".to_string()))
  }
}

fn pipeline(mode: BackendMode) -> Pipeline {
  Pipeline::new(
    detection_stage(mode),
    PoseStage::disabled(),
    ExpressionStage::disabled(),
    Synthesizer::default(),
  )
}

#[derive(Clone, Default)]
struct RecordingOutput(Arc<Mutex<Vec<SceneDescription>>>);

impl Render for RecordingOutput {
  type Error = std::convert::Infallible;

  fn render_result(&self, _frame: &Frame, scene: &SceneDescription) -> Result<(), Self::Error> {
    self.0.lock().push(scene.clone());
    Ok(())
  }
}

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Vec<String>>>);

impl AudioSink for RecordingSink {
  fn speak(&mut self, text: &str, _cancel: &CancelToken) -> Result<(), AudioSinkError> {
    self.0.lock().push(text.to_string());
    Ok(())
  }
}

#[test]
fn one_shot_describes_person_left_and_chair_right() {
  let output = RecordingOutput::default();
  let scene = OneShotTask
    .run_task(
      ScriptedSource::frames(1),
      &pipeline(person_and_chair()),
      output.clone(),
    )
    .unwrap();

  assert_eq!(scene.summary_text, "person on your left, chair on your right");
  assert_eq!(scene.gesture, GestureState::Undetermined);
  assert_eq!(output.0.lock().len(), 1);
}

#[test]
fn one_shot_without_frames_fails() {
  let result = OneShotTask.run_task(
    ScriptedSource::frames(0),
    &pipeline(person_and_chair()),
    RecordingOutput::default(),
  );
  assert!(matches!(result, Err(TaskError::NoFrame)));
}

#[test]
fn capture_failure_on_first_read_ends_cleanly() {
  let source = ScriptedSource::with_script(vec![Err("unplugged".to_string())]);
  let output = RecordingOutput::default();
  let summary = ContinuousTask::new(StopSignal::new())
    .run_task(source.clone(), &pipeline(person_and_chair()), output.clone())
    .unwrap();

  assert_eq!(summary.exit, LoopExit::CaptureFailed);
  assert_eq!(summary.frames_processed, 0);
  assert!(source.released.load(Ordering::SeqCst));
  assert!(output.0.lock().is_empty());
}

#[test]
fn empty_scenes_are_never_spoken() {
  let sink = RecordingSink::default();
  let output = RecordingOutput::default();
  let summary = ContinuousTask::new(StopSignal::new())
    .with_audio(Box::new(sink.clone()))
    .run_task(
      ScriptedSource::frames(3),
      &pipeline(BackendMode::Rows(Vec::new())),
      output.clone(),
    )
    .unwrap();

  assert_eq!(summary.exit, LoopExit::EndOfStream);
  assert_eq!(summary.frames_processed, 3);
  assert!(output.0.lock().iter().all(SceneDescription::is_silent));
  assert!(sink.0.lock().is_empty());
}

#[test]
fn stop_raised_before_start_reads_nothing() {
  let stop = StopSignal::new();
  stop.raise();
  let source = ScriptedSource::frames(5);
  let summary = ContinuousTask::new(stop)
    .run_task(
      source.clone(),
      &pipeline(person_and_chair()),
      RecordingOutput::default(),
    )
    .unwrap();

  assert_eq!(summary.exit, LoopExit::Stopped);
  assert_eq!(source.reads.load(Ordering::SeqCst), 0);
  assert!(source.released.load(Ordering::SeqCst));
}

#[test]
fn frame_limit_stops_the_loop() {
  let source = ScriptedSource::frames(10);
  let summary = ContinuousTask::new(StopSignal::new())
    .with_frame_number(Some(4))
    .run_task(
      source.clone(),
      &pipeline(person_and_chair()),
      RecordingOutput::default(),
    )
    .unwrap();

  assert_eq!(summary.exit, LoopExit::FrameLimit);
  assert_eq!(summary.frames_processed, 4);
  assert_eq!(source.reads.load(Ordering::SeqCst), 4);
}

#[test]
fn malformed_detector_output_drops_the_frame() {
  let output = RecordingOutput::default();
  let summary = ContinuousTask::new(StopSignal::new())
    .run_task(
      ScriptedSource::frames(2),
      &pipeline(BackendMode::Ragged),
      output.clone(),
    )
    .unwrap();

  assert_eq!(summary.frames_dropped, 2);
  assert_eq!(summary.frames_processed, 0);
  assert!(output.0.lock().is_empty());
}

#[test]
fn backend_failure_terminates_the_run() {
  let source = ScriptedSource::frames(3);
  let result = ContinuousTask::new(StopSignal::new()).run_task(
    source.clone(),
    &pipeline(BackendMode::Broken),
    RecordingOutput::default(),
  );

  assert!(matches!(
    result,
    Err(TaskError::Inference(InferenceError::Backend(_)))
  ));
  assert!(source.released.load(Ordering::SeqCst));
}

#[test]
fn late_detection_is_discarded() {
  let pipeline = pipeline(BackendMode::Slow(Duration::from_millis(40)))
    .with_deadline(Some(Duration::from_millis(5)));
  let summary = ContinuousTask::new(StopSignal::new())
    .run_task(
      ScriptedSource::frames(1),
      &pipeline,
      RecordingOutput::default(),
    )
    .unwrap();

  assert_eq!(summary.frames_dropped, 1);
}

#[test]
fn pose_failure_degrades_to_undetermined() {
  let pipeline = Pipeline::new(
    detection_stage(person_and_chair()),
    PoseStage::new(Some(Box::new(FailingPose)), 0.5),
    ExpressionStage::disabled(),
    Synthesizer::default(),
  );
  let scene = pipeline.process(&frame(0)).unwrap();

  assert_eq!(scene.gesture, GestureState::Undetermined);
  assert_eq!(scene.detections.len(), 2);
}

#[test]
fn parallel_stages_match_sequential() {
  let build = |parallel| {
    Pipeline::new(
      detection_stage(person_and_chair()),
      PoseStage::new(
        Some(Box::new(ScriptedPose {
          raised: Mutex::new(vec![true]),
        })),
        0.5,
      ),
      ExpressionStage::disabled(),
      Synthesizer::default(),
    )
    .with_parallel_stages(parallel)
  };

  let sequential = build(false).process(&frame(0)).unwrap();
  let parallel = build(true).process(&frame(0)).unwrap();
  assert_eq!(sequential, parallel);
  assert_eq!(parallel.gesture, GestureState::HandsRaised);
}

#[test]
fn gesture_is_held_before_switching() {
  // 弹出顺序：raised, raised, lowered, lowered
  let pose = ScriptedPose {
    raised: Mutex::new(vec![false, false, true, true]),
  };
  let pipeline = Pipeline::new(
    detection_stage(person_and_chair()),
    PoseStage::new(Some(Box::new(pose)), 0.5),
    ExpressionStage::disabled(),
    Synthesizer::default(),
  );
  let output = RecordingOutput::default();
  ContinuousTask::new(StopSignal::new())
    .with_hold_frames(2)
    .run_task(ScriptedSource::frames(4), &pipeline, output.clone())
    .unwrap();

  let gestures = output
    .0
    .lock()
    .iter()
    .map(|scene| scene.gesture)
    .collect::<Vec<_>>();
  assert_eq!(
    gestures,
    vec![
      GestureState::Undetermined,
      GestureState::HandsRaised,
      GestureState::HandsRaised,
      GestureState::HandsLowered,
    ]
  );
}

#[test]
fn missing_labels_file_fails_at_startup() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = Config::default();
  config.detection.labels = dir.path().join("coco.names");
  let model = url::Url::parse("onnx:///models/yolo.onnx").unwrap();

  let result = Pipeline::from_config(&config, &model, None, None);
  assert!(matches!(
    result,
    Err(StartupConfigError::MissingFile { .. })
  ));
}

#[test]
fn unknown_model_scheme_fails_at_startup() {
  let dir = tempfile::tempdir().unwrap();
  let labels = dir.path().join("coco.names");
  std::fs::write(&labels, "person\nchair\n").unwrap();
  let mut config = Config::default();
  config.detection.labels = labels;
  let model = url::Url::parse("rknn:///models/yolo.rknn").unwrap();

  let result = Pipeline::from_config(&config, &model, None, None);
  assert!(matches!(
    result,
    Err(StartupConfigError::UnsupportedModel(_))
  ));
}

/// 第一帧立即返回，第二帧卡住一段时间
struct StallingSource {
  calls: usize,
  stall: Duration,
}

impl FrameSource for StallingSource {
  fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
    self.calls += 1;
    match self.calls {
      1 => Ok(Some(frame(0))),
      2 => {
        thread::sleep(self.stall);
        Ok(Some(frame(1)))
      }
      _ => Ok(None),
    }
  }
}

/// 播报一直持续到被取消，记录取消被观察到的时间
struct UntilCancelled {
  started: mpsc::Sender<()>,
  cancelled_at: Arc<Mutex<Option<Instant>>>,
}

impl AudioSink for UntilCancelled {
  fn speak(&mut self, _text: &str, cancel: &CancelToken) -> Result<(), AudioSinkError> {
    let _ = self.started.send(());
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
      if cancel.is_cancelled() {
        self.cancelled_at.lock().get_or_insert_with(Instant::now);
        return Ok(());
      }
      thread::sleep(Duration::from_millis(2));
    }
    Ok(())
  }
}

#[test]
fn stop_cancels_speech_while_capture_is_blocked() {
  let stop = StopSignal::new();
  let (started_tx, started_rx) = mpsc::channel();
  let cancelled_at = Arc::new(Mutex::new(None));
  let sink = UntilCancelled {
    started: started_tx,
    cancelled_at: cancelled_at.clone(),
  };

  let raiser = {
    let stop = stop.clone();
    thread::spawn(move || {
      started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
      thread::sleep(Duration::from_millis(100));
      let raised_at = Instant::now();
      stop.raise();
      raised_at
    })
  };

  let source = StallingSource {
    calls: 0,
    stall: Duration::from_millis(1500),
  };
  let summary = ContinuousTask::new(stop)
    .with_audio(Box::new(sink))
    .run_task(source, &pipeline(person_and_chair()), RecordingOutput::default())
    .unwrap();

  let raised_at = raiser.join().unwrap();
  let cancelled_at = (*cancelled_at.lock()).expect("speech was never cancelled");
  assert!(cancelled_at.duration_since(raised_at) < Duration::from_millis(300));
  assert_eq!(summary.exit, LoopExit::Stopped);
}
