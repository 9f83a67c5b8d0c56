// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/bin/preprocess_image.rs - 图像预处理为引擎输入
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

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use qiaojie::letterbox::{DEFAULT_CANVAS_SIZE, load_image, preprocess, write_preprocessed};

/// 等比缩放加灰边后保存为平面 float32 输入文件
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入图像
  #[arg(long, value_name = "IMAGE")]
  pub image: PathBuf,
  /// 输出 .bin 文件
  #[arg(long, value_name = "OUTPUT")]
  pub out: PathBuf,
  /// 画布边长
  #[arg(long, value_name = "SIZE", default_value_t = DEFAULT_CANVAS_SIZE)]
  pub size: u32,
  /// 不输出摘要
  #[arg(long)]
  pub quiet: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入图像: {}", args.image.display());
  let image = load_image(&args.image)
    .with_context(|| format!("无法读取图像 {}", args.image.display()))?;
  let preprocessed = preprocess(&image, args.size)?;
  write_preprocessed(&args.out, &preprocessed)
    .with_context(|| format!("无法写入 {}", args.out.display()))?;

  if !args.quiet {
    let meta = &preprocessed.meta;
    let (new_w, new_h) = meta.resized_extent();
    println!("Original size: {}x{}", meta.original_width, meta.original_height);
    println!("Resized size: {}x{}", new_w, new_h);
    println!(
      "Padded size: {}x{} (offset {}, {})",
      meta.canvas_size, meta.canvas_size, meta.pad_x, meta.pad_y
    );
    println!("Image array shape: {:?}", preprocessed.pixels.shape());
    let bytes = std::fs::metadata(&args.out)?.len();
    println!();
    println!("Wrote: {}", args.out.display());
    println!("File size: {:.2} MB", bytes as f64 / (1024.0 * 1024.0));
  }
  Ok(())
}
