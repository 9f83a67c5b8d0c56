// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/letterbox.rs - 等比缩放加边框的预处理及其二进制格式
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

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use image::{ImageReader, RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  frame::{PlanarFrame, RGB_CHANNELS},
  utils::{ensure_exists, write_atomically},
};

/// 边框填充色
pub const PAD_VALUE: u8 = 114;
pub const DEFAULT_CANVAS_SIZE: u32 = 640;
/// orig_w, orig_h, scale, pad_x, pad_y, canvas_size 各 4 字节
pub const HEADER_SIZE: usize = 24;

#[derive(Error, Debug)]
pub enum LetterboxError {
  #[error("尺寸无效: 源图像 {width}x{height}, 画布 {canvas_size}")]
  InvalidDimensions {
    width: u32,
    height: u32,
    canvas_size: u32,
  },
  #[error("输入被截断: 读取 {field} 需要 {needed} 字节, 仅有 {available} 字节")]
  TruncatedInput {
    field: &'static str,
    needed: usize,
    available: usize,
  },
  #[error("头部格式错误: {0}")]
  MalformedHeader(String),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("文件不存在: {}", .0.display())]
  MissingFile(PathBuf),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxMeta {
  pub original_width: u32,
  pub original_height: u32,
  pub scale: f32,
  pub pad_x: u32,
  pub pad_y: u32,
  pub canvas_size: u32,
}

impl LetterboxMeta {
  pub fn compute(width: u32, height: u32, canvas_size: u32) -> Result<Self, LetterboxError> {
    if width == 0 || height == 0 || canvas_size == 0 {
      return Err(LetterboxError::InvalidDimensions {
        width,
        height,
        canvas_size,
      });
    }
    let size = canvas_size as f64;
    // 文件头只保存 f32 的缩放比例，宽高与偏移都从这个值推出
    let scale = (size / width as f64).min(size / height as f64) as f32;
    let (new_w, new_h) = resized_extent(width, height, scale, canvas_size);
    Ok(Self {
      original_width: width,
      original_height: height,
      scale,
      pad_x: (canvas_size - new_w) / 2,
      pad_y: (canvas_size - new_h) / 2,
      canvas_size,
    })
  }

  /// 缩放后图像在画布中的宽高
  pub fn resized_extent(&self) -> (u32, u32) {
    resized_extent(
      self.original_width,
      self.original_height,
      self.scale,
      self.canvas_size,
    )
  }
}

fn resized_extent(width: u32, height: u32, scale: f32, canvas_size: u32) -> (u32, u32) {
  let fit = |extent: u32| ((extent as f64 * scale as f64).round() as u32).clamp(1, canvas_size);
  (fit(width), fit(height))
}

/// 画布上的平面 RGB 像素及其几何信息，检测坐标都在这个画布空间内
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedImage {
  pub meta: LetterboxMeta,
  pub pixels: PlanarFrame,
}

pub fn preprocess(image: &RgbImage, canvas_size: u32) -> Result<PreprocessedImage, LetterboxError> {
  let (width, height) = image.dimensions();
  let meta = LetterboxMeta::compute(width, height, canvas_size)?;
  let (new_w, new_h) = meta.resized_extent();
  debug!(
    "letterbox: {}x{} -> {}x{}, 偏移 ({}, {})",
    width, height, new_w, new_h, meta.pad_x, meta.pad_y
  );

  let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);
  let background = PAD_VALUE as f32 / 255.0;
  let mut pixels = PlanarFrame::filled(canvas_size, canvas_size, [background; RGB_CHANNELS]);
  pixels.paste(&resized, meta.pad_x, meta.pad_y);

  Ok(PreprocessedImage { meta, pixels })
}

impl PreprocessedImage {
  fn header_bytes(&self) -> [u8; HEADER_SIZE] {
    let meta = &self.meta;
    let mut header = [0u8; HEADER_SIZE];
    LittleEndian::write_u32(&mut header[0..4], meta.original_width);
    LittleEndian::write_u32(&mut header[4..8], meta.original_height);
    LittleEndian::write_f32(&mut header[8..12], meta.scale);
    LittleEndian::write_u32(&mut header[12..16], meta.pad_x);
    LittleEndian::write_u32(&mut header[16..20], meta.pad_y);
    LittleEndian::write_u32(&mut header[20..24], meta.canvas_size);
    header
  }

  pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), LetterboxError> {
    writer.write_all(&self.header_bytes())?;
    for &value in self.pixels.as_slice() {
      writer.write_f32::<LittleEndian>(value)?;
    }
    Ok(())
  }

  pub fn serialize(&self) -> Vec<u8> {
    let pixels = self.pixels.as_slice();
    let mut bytes = Vec::with_capacity(HEADER_SIZE + pixels.len() * 4);
    bytes.extend_from_slice(&self.header_bytes());
    for value in pixels {
      bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
  }

  pub fn deserialize(bytes: &[u8]) -> Result<Self, LetterboxError> {
    if bytes.len() < HEADER_SIZE {
      return Err(LetterboxError::TruncatedInput {
        field: "header",
        needed: HEADER_SIZE,
        available: bytes.len(),
      });
    }

    let mut cursor = Cursor::new(bytes);
    let meta = LetterboxMeta {
      original_width: cursor.read_u32::<LittleEndian>()?,
      original_height: cursor.read_u32::<LittleEndian>()?,
      scale: cursor.read_f32::<LittleEndian>()?,
      pad_x: cursor.read_u32::<LittleEndian>()?,
      pad_y: cursor.read_u32::<LittleEndian>()?,
      canvas_size: cursor.read_u32::<LittleEndian>()?,
    };
    if meta.canvas_size == 0 {
      return Err(LetterboxError::InvalidDimensions {
        width: meta.original_width,
        height: meta.original_height,
        canvas_size: 0,
      });
    }

    let side = meta.canvas_size as usize;
    let needed = side
      .checked_mul(side)
      .and_then(|plane| plane.checked_mul(RGB_CHANNELS * 4))
      .ok_or_else(|| {
        LetterboxError::MalformedHeader(format!("画布尺寸 {} 过大", meta.canvas_size))
      })?;
    let available = bytes.len() - HEADER_SIZE;
    if available < needed {
      return Err(LetterboxError::TruncatedInput {
        field: "pixels",
        needed,
        available,
      });
    }
    if available > needed {
      return Err(LetterboxError::MalformedHeader(format!(
        "像素数据之后还有 {} 字节",
        available - needed
      )));
    }

    let mut values = vec![0f32; needed / 4];
    cursor.read_f32_into::<LittleEndian>(&mut values)?;
    let pixels = PlanarFrame::from_vec(meta.canvas_size, meta.canvas_size, values)
      .map_err(|e| LetterboxError::MalformedHeader(e.to_string()))?;
    Ok(Self { meta, pixels })
  }

  /// 还原为 8 位画布图像，用于绘制检测框
  pub fn canvas(&self) -> RgbImage {
    self.pixels.to_rgb_image()
  }
}

pub fn load_image(path: &Path) -> Result<RgbImage, LetterboxError> {
  ensure_exists(path).map_err(|e| LetterboxError::MissingFile(e.0))?;
  Ok(ImageReader::open(path)?.decode()?.into_rgb8())
}

pub fn write_preprocessed(path: &Path, image: &PreprocessedImage) -> Result<(), LetterboxError> {
  write_atomically(path, |file| image.write_to(file))?;
  info!("已写入预处理图像: {}", path.display());
  Ok(())
}

pub fn read_preprocessed(path: &Path) -> Result<PreprocessedImage, LetterboxError> {
  ensure_exists(path).map_err(|e| LetterboxError::MissingFile(e.0))?;
  PreprocessedImage::deserialize(&std::fs::read(path)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  #[test]
  fn wide_image_is_padded_vertically() {
    let meta = LetterboxMeta::compute(1280, 720, 640).unwrap();
    assert_eq!(meta.scale, 0.5);
    assert_eq!(meta.resized_extent(), (640, 360));
    assert_eq!((meta.pad_x, meta.pad_y), (0, 140));
  }

  #[test]
  fn tiny_extent_is_clamped_to_one_pixel() {
    let meta = LetterboxMeta::compute(4000, 1, 64).unwrap();
    assert_eq!(meta.resized_extent(), (64, 1));
    assert_eq!(meta.pad_y, 31);
  }

  #[test]
  fn pad_matches_extent_from_stored_scale() {
    let heights = [1, 7, 100, 333, 448, 480, 720, 1080, 2000];
    for canvas_size in [320, 416, 640] {
      for width in (1..=1000).step_by(3) {
        for height in heights {
          let meta = LetterboxMeta::compute(width, height, canvas_size).unwrap();
          let fit = |extent: u32| {
            ((extent as f64 * meta.scale as f64).round() as u32).clamp(1, canvas_size)
          };
          let (new_w, new_h) = meta.resized_extent();
          assert_eq!((new_w, new_h), (fit(width), fit(height)));
          assert_eq!(meta.pad_x, (canvas_size - new_w) / 2);
          assert_eq!(meta.pad_y, (canvas_size - new_h) / 2);
          let right = canvas_size - new_w - meta.pad_x;
          let bottom = canvas_size - new_h - meta.pad_y;
          assert!(right - meta.pad_x <= 1, "{width}x{height}@{canvas_size}");
          assert!(bottom - meta.pad_y <= 1, "{width}x{height}@{canvas_size}");
        }
      }
    }
  }

  #[test]
  fn pasted_region_starts_at_pad() {
    let gray = [114.0 / 255.0; 3];
    for (width, height, canvas_size) in [(7, 448, 416), (448, 7, 416), (13, 300, 320), (1000, 333, 640)] {
      let image = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
      let pre = preprocess(&image, canvas_size).unwrap();
      let meta = pre.meta;
      let (new_w, new_h) = meta.resized_extent();

      let row = meta.pad_y + new_h / 2;
      let painted: Vec<u32> = (0..canvas_size)
        .filter(|&x| pre.pixels.pixel(x, row) != gray)
        .collect();
      assert_eq!(painted.first(), Some(&meta.pad_x), "{width}x{height}@{canvas_size}");
      assert_eq!(painted.len() as u32, new_w, "{width}x{height}@{canvas_size}");

      let column = meta.pad_x + new_w / 2;
      let painted: Vec<u32> = (0..canvas_size)
        .filter(|&y| pre.pixels.pixel(column, y) != gray)
        .collect();
      assert_eq!(painted.first(), Some(&meta.pad_y), "{width}x{height}@{canvas_size}");
      assert_eq!(painted.len() as u32, new_h, "{width}x{height}@{canvas_size}");

      let restored = PreprocessedImage::deserialize(&pre.serialize()).unwrap();
      assert_eq!(restored.meta.resized_extent(), (new_w, new_h));
    }
  }

  #[test]
  fn serialize_matches_streamed_write() {
    let pre = preprocess(&RgbImage::from_pixel(5, 9, Rgb([10, 20, 30])), 12).unwrap();
    let mut streamed = Vec::new();
    pre.write_to(&mut streamed).unwrap();
    assert_eq!(pre.serialize(), streamed);
  }

  #[test]
  fn zero_dimensions_are_rejected() {
    assert!(matches!(
      LetterboxMeta::compute(0, 10, 640),
      Err(LetterboxError::InvalidDimensions { .. })
    ));
    assert!(matches!(
      LetterboxMeta::compute(10, 10, 0),
      Err(LetterboxError::InvalidDimensions { .. })
    ));
  }

  #[test]
  fn canvas_is_centered_with_gray_background() {
    let image = RgbImage::from_pixel(40, 20, Rgb([255, 0, 0]));
    let pre = preprocess(&image, 32).unwrap();
    assert_eq!(pre.pixels.shape(), [1, 3, 32, 32]);
    assert_eq!((pre.meta.pad_x, pre.meta.pad_y), (0, 8));

    let gray = 114.0 / 255.0;
    assert_eq!(pre.pixels.pixel(0, 0), [gray; 3]);
    assert_eq!(pre.pixels.pixel(31, 31), [gray; 3]);
    assert_eq!(pre.pixels.pixel(16, 16), [1.0, 0.0, 0.0]);
  }

  #[test]
  fn serialized_layout() {
    let image = RgbImage::from_pixel(8, 4, Rgb([0, 0, 0]));
    let pre = preprocess(&image, 8).unwrap();
    let bytes = pre.serialize();
    assert_eq!(bytes.len(), HEADER_SIZE + 3 * 8 * 8 * 4);
    assert_eq!(&bytes[0..4], &8u32.to_le_bytes());
    assert_eq!(&bytes[4..8], &4u32.to_le_bytes());
    assert_eq!(&bytes[8..12], &1.0f32.to_le_bytes());
    assert_eq!(&bytes[16..20], &2u32.to_le_bytes());
    assert_eq!(&bytes[20..24], &8u32.to_le_bytes());

    assert_eq!(PreprocessedImage::deserialize(&bytes).unwrap(), pre);
  }

  #[test]
  fn truncated_buffers_are_rejected() {
    let image = RgbImage::from_pixel(4, 4, Rgb([9, 9, 9]));
    let bytes = preprocess(&image, 4).unwrap().serialize();
    assert!(matches!(
      PreprocessedImage::deserialize(&bytes[..10]),
      Err(LetterboxError::TruncatedInput { field: "header", .. })
    ));
    assert!(matches!(
      PreprocessedImage::deserialize(&bytes[..bytes.len() - 1]),
      Err(LetterboxError::TruncatedInput { field: "pixels", .. })
    ));
  }

  #[test]
  fn file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("input.bin");
    let pre = preprocess(&RgbImage::from_pixel(6, 3, Rgb([1, 2, 3])), 6).unwrap();
    write_preprocessed(&path, &pre).unwrap();
    assert_eq!(read_preprocessed(&path).unwrap(), pre);
    assert!(matches!(
      read_preprocessed(&dir.path().join("missing.bin")),
      Err(LetterboxError::MissingFile(_))
    ));
  }
}
