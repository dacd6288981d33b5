// 该文件是 Tingjing （听境） 项目的一部分。
// src/input/image_folder.rs - 图片目录输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{collections::VecDeque, path::PathBuf};

use image::{ImageFormat, ImageReader};
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  input::{CaptureError, FrameSource},
  url_path,
};

const IMAGE_FOLDER_SCHEME: &str = "folder";

/// 目录中的所有图片，按文件名排序逐帧读取
pub struct ImageFolderInput {
  pending: VecDeque<PathBuf>,
  sequence: u64,
}

impl ImageFolderInput {
  pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CaptureError> {
    let dir = dir.into();
    let mut files = std::fs::read_dir(&dir)?
      .filter_map(|entry| entry.ok().map(|e| e.path()))
      .filter(|path| path.is_file() && ImageFormat::from_path(path).is_ok())
      .collect::<Vec<_>>();
    files.sort();

    info!("图片目录 {}: {} 个文件", dir.display(), files.len());
    Ok(Self {
      pending: files.into(),
      sequence: 0,
    })
  }
}

impl FromUrl for ImageFolderInput {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != IMAGE_FOLDER_SCHEME {
      return Err(CaptureError::SchemeMismatch(url.to_string()));
    }
    Self::open(url_path(url))
  }
}

impl FromUrlWithScheme for ImageFolderInput {
  const SCHEME: &'static str = IMAGE_FOLDER_SCHEME;
}

impl FrameSource for ImageFolderInput {
  fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
    let Some(path) = self.pending.pop_front() else {
      return Ok(None);
    };

    debug!("读取 {}", path.display());
    let image = ImageReader::open(&path)?.with_guessed_format()?.decode()?;
    let frame = Frame::from_rgb_image(image.into_rgb8(), self.sequence)?;
    self.sequence += 1;
    Ok(Some(frame))
  }

  fn release(&mut self) {
    self.pending.clear();
  }
}

#[cfg(test)]
mod tests {
  use image::{Rgb, RgbImage};

  use super::*;

  #[test]
  fn frames_come_in_name_order_with_sequence() {
    let dir = tempfile::tempdir().unwrap();
    for (name, value) in [("b.png", 2u8), ("a.png", 1), ("c.png", 3)] {
      RgbImage::from_pixel(2, 2, Rgb([value; 3]))
        .save(dir.path().join(name))
        .unwrap();
    }
    std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

    let mut input = ImageFolderInput::open(dir.path()).unwrap();
    let mut seen = Vec::new();
    while let Some(frame) = input.next_frame().unwrap() {
      seen.push((frame.sequence(), frame.rgb_at(0, 0)[0]));
    }
    assert_eq!(seen, vec![(0, 1), (1, 2), (2, 3)]);
  }

  #[test]
  fn undecodable_file_is_capture_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("broken.png"), b"not a png").unwrap();
    let mut input = ImageFolderInput::open(dir.path()).unwrap();
    assert!(input.next_frame().is_err());
  }
}
