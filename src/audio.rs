// 该文件是 Tingjing （听境） 项目的一部分。
// src/audio.rs - 语音播报
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

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

use thiserror::Error;
use tracing::info;

use crate::config::{AudioConfig, AudioEngine};

mod espeak;
mod slot;
mod worker;

pub use self::espeak::EspeakSink;
pub use self::slot::LatestSlot;
pub use self::worker::SpeechWorker;

#[derive(Error, Debug)]
pub enum AudioSinkError {
  #[error("语音引擎不可用: {0}")]
  Unavailable(String),
  #[error("语音合成失败: {0}")]
  Failed(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

/// 取消正在进行的播报
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// 文本到语音的黑盒
///
/// `speak` 阻塞到播放结束，或在 `cancel` 被触发后尽快返回。
pub trait AudioSink: Send {
  fn speak(&mut self, text: &str, cancel: &CancelToken) -> Result<(), AudioSinkError>;
}

impl<S: AudioSink + ?Sized> AudioSink for Box<S> {
  fn speak(&mut self, text: &str, cancel: &CancelToken) -> Result<(), AudioSinkError> {
    (**self).speak(text, cancel)
  }
}

/// 把摘要写进日志
pub struct LogSink;

impl AudioSink for LogSink {
  fn speak(&mut self, text: &str, _cancel: &CancelToken) -> Result<(), AudioSinkError> {
    info!("播报: {}", text);
    Ok(())
  }
}

pub struct NullSink;

impl AudioSink for NullSink {
  fn speak(&mut self, _text: &str, _cancel: &CancelToken) -> Result<(), AudioSinkError> {
    Ok(())
  }
}

pub fn sink_from_config(config: &AudioConfig) -> Box<dyn AudioSink> {
  match config.engine {
    AudioEngine::Espeak => Box::new(EspeakSink::new(config.rate, config.volume)),
    AudioEngine::Log => Box::new(LogSink),
    AudioEngine::None => Box::new(NullSink),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cancel_is_shared_between_clones() {
    let token = CancelToken::new();
    let other = token.clone();
    assert!(!other.is_cancelled());
    token.cancel();
    assert!(other.is_cancelled());
  }

  #[test]
  fn log_and_null_sinks_never_fail() {
    let token = CancelToken::new();
    assert!(LogSink.speak("person on your left", &token).is_ok());
    assert!(NullSink.speak("person on your left", &token).is_ok());
  }
}
