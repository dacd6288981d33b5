// 该文件是 Tingjing （听境） 项目的一部分。
// src/audio/espeak.rs - espeak-ng 语音引擎
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  io::{ErrorKind, Write},
  process::{Command, Stdio},
  thread,
  time::Duration,
};

use tracing::debug;

use crate::audio::{AudioSink, AudioSinkError, CancelToken};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// 通过 `espeak-ng` 命令直接播放
pub struct EspeakSink {
  program: String,
  rate: u32,
  volume: f32,
}

impl EspeakSink {
  pub fn new(rate: u32, volume: f32) -> Self {
    Self::with_program("espeak-ng", rate, volume)
  }

  pub fn with_program(program: impl Into<String>, rate: u32, volume: f32) -> Self {
    Self {
      program: program.into(),
      rate,
      volume,
    }
  }

  /// 文本从标准输入读入，不会被当作选项
  fn command(&self) -> Command {
    // espeak-ng 音量范围 0-200
    let amplitude = (self.volume.clamp(0.0, 1.0) * 200.0).round() as u32;

    let mut command = Command::new(&self.program);
    command
      .arg("-s")
      .arg(self.rate.to_string())
      .arg("-a")
      .arg(amplitude.to_string())
      .arg("--stdin")
      .stdin(Stdio::piped())
      .stdout(Stdio::null())
      .stderr(Stdio::null());
    command
  }
}

impl AudioSink for EspeakSink {
  fn speak(&mut self, text: &str, cancel: &CancelToken) -> Result<(), AudioSinkError> {
    let mut child = self.command().spawn().map_err(|e| match e.kind() {
      ErrorKind::NotFound => AudioSinkError::Unavailable(format!("找不到 {}", self.program)),
      _ => AudioSinkError::Io(e),
    })?;

    // 写完即关闭标准输入，espeak-ng 读到结尾才会退出
    if let Some(mut stdin) = child.stdin.take() {
      if let Err(e) = stdin.write_all(utterance(text).as_bytes()) {
        let _ = child.kill();
        let _ = child.wait();
        return Err(AudioSinkError::Io(e));
      }
    }

    loop {
      if let Some(status) = child.try_wait()? {
        return if status.success() {
          Ok(())
        } else {
          Err(AudioSinkError::Failed(format!("{} 退出: {}", self.program, status)))
        };
      }
      if cancel.is_cancelled() {
        debug!("播报被打断");
        let _ = child.kill();
        let _ = child.wait();
        return Ok(());
      }
      thread::sleep(POLL_INTERVAL);
    }
  }
}

fn utterance(text: &str) -> String {
  let mut line = text
    .chars()
    .map(|c| if c.is_control() { ' ' } else { c })
    .collect::<String>();
  line.push('\n');
  line
}
