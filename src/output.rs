// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/output.rs - 可视化结果输出
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

use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::info;

use crate::utils::write_atomically;

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("字体文件无效: {}", .0.display())]
  InvalidFont(PathBuf),
  #[error("文件不存在: {}", .0.display())]
  MissingFile(PathBuf),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

pub mod draw;
pub use self::draw::Visualizer;

/// 按扩展名选择编码格式保存图像
pub fn save_image(path: &Path, image: &RgbImage) -> Result<(), DrawError> {
  let format = ImageFormat::from_path(path)?;
  write_atomically(path, |file| {
    image.write_to(file, format)?;
    Ok::<_, DrawError>(())
  })?;
  info!("已保存可视化结果: {}", path.display());
  Ok(())
}
