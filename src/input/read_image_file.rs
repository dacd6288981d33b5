// 该文件是 Tingjing （听境） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::{ImageReader, RgbImage};
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  input::{CaptureError, FrameSource},
  url_path,
};

const READ_IMAGE_FILE_SCHEME: &str = "image";

/// 单张图片，读取一帧后结束
pub struct ImageFileInput {
  image: Option<RgbImage>,
}

impl ImageFileInput {
  pub fn new(image: RgbImage) -> Self {
    Self { image: Some(image) }
  }
}

impl FromUrl for ImageFileInput {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != READ_IMAGE_FILE_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        READ_IMAGE_FILE_SCHEME,
        url.scheme()
      );
      return Err(CaptureError::SchemeMismatch(url.to_string()));
    }

    let path = url_path(url);
    let image = ImageReader::open(&path)?.decode()?;
    info!("读取图片 {}: {}x{}", path, image.width(), image.height());

    Ok(Self::new(image.into_rgb8()))
  }
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = READ_IMAGE_FILE_SCHEME;
}

impl FrameSource for ImageFileInput {
  fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
    match self.image.take() {
      Some(image) => Ok(Some(Frame::from_rgb_image(image, 0)?)),
      None => Ok(None),
    }
  }

  fn release(&mut self) {
    self.image = None;
  }
}
