// 该文件是 Tingjing （听境） 项目的一部分。
// src/output/draw.rs - 场景叠加绘制
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  frame::Frame,
  scene::{SceneDescription, SceneObject},
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_COLOR: [u8; 3] = [0, 255, 0];
const STATUS_COLOR: [u8; 3] = [255, 255, 0];
const STATUS_ORIGIN: (i32, i32) = (10, 10);

#[derive(Error, Debug)]
pub enum FontLoadError {
  #[error("读取字体文件失败: {0}")]
  Io(#[from] std::io::Error),
  #[error("无效的字体文件: {0}")]
  Invalid(String),
}

pub fn load_font(path: &Path) -> Result<FontVec, FontLoadError> {
  let data = std::fs::read(path)?;
  let font = FontVec::try_from_vec(data).map_err(|e| FontLoadError::Invalid(e.to_string()))?;
  info!("加载字体: {}", path.display());
  Ok(font)
}

/// 检测框旁的文字：标签、置信度、可选的距离
pub fn overlay_label(object: &SceneObject) -> String {
  let mut label = format!(
    "{} {:.2}",
    object.detection.label, object.detection.confidence
  );
  if let Some(distance) = object.distance {
    label.push_str(&format!(" {:.0}cm", distance));
  }
  label
}

pub fn status_lines(scene: &SceneDescription) -> [String; 2] {
  [
    format!("Action: {}", scene.gesture.label()),
    format!("Expression: {}", scene.expression),
  ]
}

/// 没有字体时只画框
pub struct Draw {
  font: Option<FontVec>,
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_vertical_padding: i32,
  box_color: [u8; 3],
}

impl Default for Draw {
  fn default() -> Self {
    Self::new(None)
  }
}

impl Draw {
  pub fn new(font: Option<FontVec>) -> Self {
    Self {
      font,
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      box_color: BOX_COLOR,
    }
  }

  /// 读取 `?font=<ttf 路径>`
  pub fn from_url(url: &Url) -> Result<Self, FontLoadError> {
    let font = url
      .query_pairs()
      .find(|(k, _)| k == "font")
      .map(|(_, v)| load_font(Path::new(v.as_ref())))
      .transpose()?;
    Ok(Self::new(font))
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  pub fn draw_scene(&self, frame: &Frame, scene: &SceneDescription) -> RgbImage {
    let mut image = frame.to_rgb_image();
    for object in &scene.detections {
      self.draw_object(&mut image, object);
    }
    self.draw_status(&mut image, scene);
    image
  }

  fn draw_object(&self, image: &mut RgbImage, object: &SceneObject) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let bbox = object.detection.bbox;

    let x_min = (bbox.x.floor() as i32).clamp(0, w - 1);
    let y_min = (bbox.y.floor() as i32).clamp(0, h - 1);
    let x_max = ((bbox.x + bbox.width).ceil() as i32).clamp(0, w - 1);
    let y_max = ((bbox.y + bbox.height).ceil() as i32).clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
      return;
    }

    // 边框加粗为 2 像素
    for thickness in 0..2 {
      let width = x_max - x_min - 2 * thickness;
      let height = y_max - y_min - 2 * thickness;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect =
        Rect::at(x_min + thickness, y_min + thickness).of_size(width as u32 + 1, height as u32 + 1);
      draw_hollow_rect_mut(image, rect, Rgb(self.box_color));
    }

    let Some(font) = &self.font else {
      return;
    };

    let label = overlay_label(object);
    let text_width = (label.chars().count() as f32 * self.label_char_width) as i32;
    let label_x = x_min;
    let label_y = (y_min - self.label_text_height).max(0);
    let label_width = text_width.min(w - label_x);
    if label_width <= 0 {
      return;
    }

    let rect = Rect::at(label_x, label_y).of_size(label_width as u32, self.label_text_height as u32);
    draw_filled_rect_mut(image, rect, Rgb(self.box_color));
    draw_text_mut(
      image,
      Rgb([0, 0, 0]),
      label_x,
      label_y + self.label_text_vertical_padding,
      PxScale::from(self.font_size),
      font,
      &label,
    );
  }

  fn draw_status(&self, image: &mut RgbImage, scene: &SceneDescription) {
    let Some(font) = &self.font else {
      return;
    };

    let (x, y) = STATUS_ORIGIN;
    for (line, text) in status_lines(scene).iter().enumerate() {
      draw_text_mut(
        image,
        Rgb(STATUS_COLOR),
        x,
        y + line as i32 * self.label_text_height,
        PxScale::from(self.font_size),
        font,
        text,
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    frame::ChannelOrder,
    model::{BBox, Detection, ExpressionLabel, GestureState},
    scene::Direction,
  };

  fn scene(distance: Option<f32>) -> SceneDescription {
    SceneDescription {
      sequence: 0,
      width: 40,
      height: 30,
      detections: vec![SceneObject {
        detection: Detection {
          label: "person".to_string(),
          confidence: 0.9,
          bbox: BBox {
            x: 5.0,
            y: 5.0,
            width: 20.0,
            height: 10.0,
          },
        },
        direction: Direction::Center,
        distance,
      }],
      gesture: GestureState::HandsRaised,
      expression: ExpressionLabel::Label("happy".to_string()),
      summary_text: "person on your center".to_string(),
    }
  }

  #[test]
  fn label_includes_distance_when_known() {
    let scene = scene(Some(212.4));
    assert_eq!(overlay_label(&scene.detections[0]), "person 0.90 212cm");
    assert_eq!(
      status_lines(&scene),
      [
        "Action: Hands raised".to_string(),
        "Expression: happy".to_string()
      ]
    );
  }

  #[test]
  fn boxes_are_drawn_without_font() {
    let frame = Frame::from_raw(40, 30, ChannelOrder::Rgb, 0, vec![0; 40 * 30 * 3]).unwrap();
    let draw = Draw::default();
    assert!(!draw.has_font());
    let image = draw.draw_scene(&frame, &scene(None));
    assert_eq!(image.dimensions(), (40, 30));
    assert_eq!(image.get_pixel(5, 5).0, BOX_COLOR);
    assert_eq!(image.get_pixel(15, 10).0, [0, 0, 0]);
  }

  #[test]
  fn missing_font_file_is_an_error() {
    let url = Url::parse("image:///tmp/out.png?font=/no/such/font.ttf").unwrap();
    assert!(matches!(Draw::from_url(&url), Err(FontLoadError::Io(_))));
  }
}
