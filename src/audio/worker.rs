// 该文件是 Tingjing （听境） 项目的一部分。
// src/audio/worker.rs - 独立的播报线程
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use crate::audio::{AudioSink, AudioSinkError, CancelToken, LatestSlot};

/// 播报线程，帧循环只向它投递摘要，从不等待播放
pub struct SpeechWorker {
  slot: LatestSlot<String>,
  cancel: CancelToken,
  handle: Option<JoinHandle<()>>,
}

impl SpeechWorker {
  pub fn spawn<S: AudioSink + 'static>(sink: S) -> Result<Self, AudioSinkError> {
    let slot = LatestSlot::new();
    let cancel = CancelToken::new();

    let handle = {
      let slot = slot.clone();
      let cancel = cancel.clone();
      thread::Builder::new()
        .name("speech".to_string())
        .spawn(move || run(sink, slot, cancel))?
    };

    Ok(Self {
      slot,
      cancel,
      handle: Some(handle),
    })
  }

  /// 空摘要不投递
  pub fn submit(&self, text: &str) {
    if text.is_empty() {
      return;
    }
    if let Some(stale) = self.slot.publish(text.to_string()) {
      debug!("丢弃未播放的摘要: {}", stale);
    }
  }

  pub fn cancel_token(&self) -> CancelToken {
    self.cancel.clone()
  }

  /// 关闭通道、打断正在播放的语音并等待线程退出
  pub fn shutdown(&mut self) {
    self.slot.close();
    self.cancel.cancel();
    if let Some(handle) = self.handle.take() {
      if handle.join().is_err() {
        warn!("播报线程异常退出");
      }
    }
  }
}

impl Drop for SpeechWorker {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn run<S: AudioSink>(mut sink: S, slot: LatestSlot<String>, cancel: CancelToken) {
  let mut failed = false;

  while let Some(text) = slot.take_blocking() {
    if cancel.is_cancelled() {
      break;
    }
    if failed {
      continue;
    }
    if let Err(e) = sink.speak(&text, &cancel) {
      if cancel.is_cancelled() {
        break;
      }
      error!("语音播报不可用，后续只保留画面输出: {}", e);
      failed = true;
    }
  }

  debug!("播报线程退出");
}
