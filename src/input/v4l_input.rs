// 该文件是 Tingjing （听境） 项目的一部分。
// src/input/v4l_input.rs - V4L 视频输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use tracing::{error, info};
use url::Url;
use v4l::{FourCC, io::traits::CaptureStream, video::Capture};

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{ChannelOrder, Frame},
  input::{CaptureError, FrameSource},
  url_path,
};

const V4L_SCHEME: &str = "v4l";

fn device_error(e: std::io::Error) -> CaptureError {
  CaptureError::Device(e.to_string())
}

/// V4L2 设备，以 RGB24 采集
pub struct V4lInput {
  device: Option<v4l::Device>,
  width: u32,
  height: u32,
  sequence: u64,
}

impl FromUrl for V4lInput {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != V4L_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        V4L_SCHEME,
        url.scheme()
      );
      return Err(CaptureError::SchemeMismatch(url.to_string()));
    }

    // v4l:///dev/video0
    let device_path = match url_path(url) {
      path if path.is_empty() || path == "/" => "/dev/video0".to_string(),
      path => path,
    };

    let device = v4l::Device::with_path(&device_path).map_err(device_error)?;
    let mut format = device.format().map_err(device_error)?;
    format.fourcc = FourCC::new(b"RGB3");
    let format = device.set_format(&format).map_err(device_error)?;
    if format.fourcc != FourCC::new(b"RGB3") {
      return Err(CaptureError::Device(format!(
        "设备不支持 RGB24, 当前格式 {}",
        format.fourcc
      )));
    }

    info!(
      "打开 V4L 设备 {}: {}x{}",
      device_path, format.width, format.height
    );
    Ok(Self {
      device: Some(device),
      width: format.width,
      height: format.height,
      sequence: 0,
    })
  }
}

impl FromUrlWithScheme for V4lInput {
  const SCHEME: &'static str = V4L_SCHEME;
}

impl FrameSource for V4lInput {
  fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
    let Some(device) = self.device.as_mut() else {
      return Ok(None);
    };

    let mut stream =
      v4l::io::mmap::Stream::with_buffers(device, v4l::buffer::Type::VideoCapture, 4)
        .map_err(device_error)?;
    let (buf, _meta) = stream.next().map_err(device_error)?;

    let size = 3 * self.width as usize * self.height as usize;
    if buf.len() < size {
      return Err(CaptureError::Device(format!(
        "缓冲区长度 {} 小于 {}",
        buf.len(),
        size
      )));
    }

    let frame = Frame::from_raw(
      self.width,
      self.height,
      ChannelOrder::Rgb,
      self.sequence,
      buf[..size].to_vec(),
    )?;
    self.sequence += 1;
    Ok(Some(frame))
  }

  fn release(&mut self) {
    self.device = None;
  }
}
