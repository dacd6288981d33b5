// 该文件是 Tingjing （听境） 项目的一部分。
// src/frame.rs - 帧定义
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

use image::{ImageBuffer, Rgb, RgbImage};
use serde::Serialize;
use thiserror::Error;

const CHANNELS: usize = 3;

/// 像素通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
  Rgb,
  Bgr,
}

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("帧尺寸不能为零: {width}x{height}")]
  EmptyShape { width: u32, height: u32 },
}

/// 一帧图像（NHWC，三通道，8 位）
///
/// 帧创建后不可修改，由产生它的那一次循环独占，所有阶段处理完毕后丢弃。
#[derive(Debug, Clone)]
pub struct Frame {
  data: Box<[u8]>,
  width: u32,
  height: u32,
  order: ChannelOrder,
  sequence: u64,
}

impl Frame {
  pub fn from_raw(
    width: u32,
    height: u32,
    order: ChannelOrder,
    sequence: u64,
    data: Vec<u8>,
  ) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::EmptyShape { width, height });
    }
    let expected = CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
      width,
      height,
      order,
      sequence,
    })
  }

  pub fn from_rgb_image(image: RgbImage, sequence: u64) -> Result<Self, FrameError> {
    let (width, height) = image.dimensions();
    Self::from_raw(width, height, ChannelOrder::Rgb, sequence, image.into_raw())
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    CHANNELS
  }

  pub fn channel_order(&self) -> ChannelOrder {
    self.order
  }

  pub fn sequence(&self) -> u64 {
    self.sequence
  }

  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }

  /// 读取 (x, y) 处的像素，按 RGB 顺序返回
  pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
    let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
    let px = &self.data[idx..idx + CHANNELS];
    match self.order {
      ChannelOrder::Rgb => [px[0], px[1], px[2]],
      ChannelOrder::Bgr => [px[2], px[1], px[0]],
    }
  }

  pub fn to_rgb_image(&self) -> RgbImage {
    match self.order {
      ChannelOrder::Rgb => ImageBuffer::from_raw(self.width, self.height, self.data.to_vec())
        .unwrap_or_else(|| ImageBuffer::from_fn(self.width, self.height, |x, y| Rgb(self.rgb_at(x, y)))),
      ChannelOrder::Bgr => {
        ImageBuffer::from_fn(self.width, self.height, |x, y| Rgb(self.rgb_at(x, y)))
      }
    }
  }
}
