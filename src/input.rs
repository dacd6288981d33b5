// 该文件是 Tingjing （听境） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use thiserror::Error;
use tracing::info;

use crate::{
  FromUrl,
  frame::{Frame, FrameError},
};

#[cfg(feature = "read_image_file")]
mod image_folder;
#[cfg(feature = "read_image_file")]
mod read_image_file;

#[cfg(feature = "read_image_file")]
pub use self::image_folder::ImageFolderInput;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::ImageFileInput;

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{
  GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder,
};

#[cfg(feature = "v4l_input")]
mod v4l_input;
#[cfg(feature = "v4l_input")]
pub use self::v4l_input::V4lInput;

#[derive(Error, Debug)]
pub enum CaptureError {
  #[error("不支持的输入地址: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("图像解码错误: {0}")]
  Image(#[from] image::ImageError),
  #[error("帧数据错误: {0}")]
  Frame(#[from] FrameError),
  #[error("采集设备错误: {0}")]
  Device(String),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer 输入错误: {0}")]
  GStreamer(#[from] GStreamerInputError),
}

/// 帧来源
///
/// `next_frame` 返回 `Ok(None)` 表示流结束；返回错误时不会重试。
pub trait FrameSource {
  fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

  /// 释放设备，可重复调用
  fn release(&mut self) {}
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
    (**self).next_frame()
  }

  fn release(&mut self) {
    (**self).release()
  }
}

/// 独占一个帧来源，离开作用域时释放
pub struct CaptureSession<S: FrameSource> {
  source: S,
  released: bool,
}

impl<S: FrameSource> CaptureSession<S> {
  pub fn new(source: S) -> Self {
    Self {
      source,
      released: false,
    }
  }

  pub fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
    if self.released {
      return Ok(None);
    }
    self.source.next_frame()
  }

  pub fn release(&mut self) {
    if !self.released {
      self.released = true;
      self.source.release();
      info!("输入设备已释放");
    }
  }
}

impl<S: FrameSource> Drop for CaptureSession<S> {
  fn drop(&mut self) {
    self.release();
  }
}

/// 按 URL 方案选择的输入
pub enum InputWrapper {
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "read_image_file")]
  ImageFolder(ImageFolderInput),
  #[cfg(feature = "gstreamer_input")]
  GStreamerInput(GStreamerInput),
  #[cfg(feature = "v4l_input")]
  V4lInput(V4lInput),
}

impl FromUrl for InputWrapper {
  type Error = CaptureError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        return Ok(InputWrapper::ReadImageFile(ImageFileInput::from_url(url)?));
      }
      if url.scheme() == ImageFolderInput::SCHEME {
        return Ok(InputWrapper::ImageFolder(ImageFolderInput::from_url(url)?));
      }
    }
    #[cfg(feature = "gstreamer_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == GStreamerInputPipelineBuilder::SCHEME {
        let input = GStreamerInputPipelineBuilder::from_url(url)?.build()?;
        return Ok(InputWrapper::GStreamerInput(input));
      }
    }
    #[cfg(feature = "v4l_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == V4lInput::SCHEME {
        return Ok(InputWrapper::V4lInput(V4lInput::from_url(url)?));
      }
    }
    Err(CaptureError::SchemeMismatch(url.to_string()))
  }
}

impl FrameSource for InputWrapper {
  fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.next_frame(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ImageFolder(input) => input.next_frame(),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.next_frame(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4lInput(input) => input.next_frame(),
      #[allow(unreachable_patterns)]
      _ => Ok(None),
    }
  }

  fn release(&mut self) {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.release(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ImageFolder(input) => input.release(),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.release(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4lInput(input) => input.release(),
      #[allow(unreachable_patterns)]
      _ => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{cell::Cell, rc::Rc};

  use super::*;

  struct Counting {
    released: Rc<Cell<usize>>,
  }

  impl FrameSource for Counting {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
      Err(CaptureError::Device("unplugged".to_string()))
    }

    fn release(&mut self) {
      self.released.set(self.released.get() + 1);
    }
  }

  #[test]
  fn session_releases_once_on_drop() {
    let released = Rc::new(Cell::new(0));
    {
      let mut session = CaptureSession::new(Counting {
        released: released.clone(),
      });
      assert!(session.next_frame().is_err());
      session.release();
      assert!(session.next_frame().unwrap().is_none());
    }
    assert_eq!(released.get(), 1);
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = url::Url::parse("rtmp://example.com/live").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(CaptureError::SchemeMismatch(_))
    ));
  }
}
