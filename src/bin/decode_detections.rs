// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/bin/decode_detections.rs - 检测结果解码、可视化与对比
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

use anyhow::{Context, Result, bail};
use clap::Parser;
use image::RgbImage;
use tracing::{info, warn};

use qiaojie::{
  detection::{
    DetectionList,
    compare::{ComparisonReport, DEFAULT_TOP},
    read_detections, write_report_file,
  },
  letterbox::{DEFAULT_CANVAS_SIZE, load_image, preprocess, read_preprocessed},
  output::{Visualizer, save_image},
};

/// 解码引擎输出的检测结果，可选地与参考结果对比
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 待检查的检测结果文件
  #[arg(long, value_name = "DETECTIONS")]
  pub detections: PathBuf,
  /// 参考检测结果文件
  #[arg(long, value_name = "REFERENCE")]
  pub reference: Option<PathBuf>,
  /// 原始图像，按 --size 重新做 letterbox 得到画布
  #[arg(long, value_name = "IMAGE", conflicts_with = "preprocessed")]
  pub image: Option<PathBuf>,
  /// 预处理后的输入文件，直接还原画布
  #[arg(long, value_name = "PREPROCESSED")]
  pub preprocessed: Option<PathBuf>,
  /// 画布边长
  #[arg(long, value_name = "SIZE", default_value_t = DEFAULT_CANVAS_SIZE)]
  pub size: u32,
  /// 标签字体文件 (TTF/OTF)
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
  /// 报告与可视化结果的输出目录
  #[arg(long, value_name = "DIR")]
  pub out_dir: Option<PathBuf>,
  /// 不生成可视化图像
  #[arg(long)]
  pub no_viz: bool,
  /// 打印与对比的条目数
  #[arg(long, value_name = "N", default_value_t = DEFAULT_TOP)]
  pub top: usize,
  /// 对比结果不一致时以错误退出
  #[arg(long)]
  pub strict: bool,
}

fn load_canvas(args: &Args) -> Result<Option<RgbImage>> {
  if let Some(path) = &args.preprocessed {
    let preprocessed = read_preprocessed(path)
      .with_context(|| format!("无法读取预处理文件 {}", path.display()))?;
    return Ok(Some(preprocessed.canvas()));
  }
  if let Some(path) = &args.image {
    let image = load_image(path).with_context(|| format!("无法读取图像 {}", path.display()))?;
    return Ok(Some(preprocess(&image, args.size)?.canvas()));
  }
  Ok(None)
}

fn print_summary(list: &DetectionList, top: usize) {
  println!("Detections: {}", list.len());
  for record in list.iter().take(top) {
    println!(
      "  {}: {:.3} at ({}, {})",
      record.class_name(),
      record.confidence(),
      record.center_x,
      record.center_y
    );
  }
}

fn emit(
  list: &DetectionList,
  title: &str,
  dir: &Path,
  canvas: Option<&RgbImage>,
  visualizer: Option<&Visualizer>,
) -> Result<()> {
  let report = dir.join("detections.txt");
  write_report_file(&report, list, title)?;
  println!("Saved: {}", report.display());

  if let (Some(canvas), Some(visualizer)) = (canvas, visualizer) {
    let rendered = visualizer.render(canvas.clone(), list, Some(title));
    let path = dir.join("detections.jpg");
    save_image(&path, &rendered)?;
    println!("Saved: {}", path.display());
  }
  Ok(())
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("检测结果: {}", args.detections.display());
  let candidate = read_detections(&args.detections)
    .with_context(|| format!("无法读取检测结果 {}", args.detections.display()))?;
  let reference = match &args.reference {
    Some(path) => Some(
      read_detections(path).with_context(|| format!("无法读取参考结果 {}", path.display()))?,
    ),
    None => None,
  };

  let canvas = if args.no_viz { None } else { load_canvas(&args)? };
  let visualizer = match (&canvas, &args.font) {
    (None, _) => None,
    (Some(_), Some(font)) => Some(Visualizer::with_font_file(font)?),
    (Some(_), None) => {
      warn!("未指定字体, 可视化结果不含标签");
      Some(Visualizer::new())
    }
  };
  if !args.no_viz && canvas.is_none() {
    warn!("未指定 --image 或 --preprocessed, 跳过可视化");
  }

  println!("=== Candidate ===");
  print_summary(&candidate, args.top);
  if let Some(dir) = &args.out_dir {
    emit(&candidate, "Candidate", dir, canvas.as_ref(), visualizer.as_ref())?;
  }

  let Some(reference) = reference else {
    return Ok(());
  };

  println!();
  println!("=== Reference ===");
  print_summary(&reference, args.top);
  if let Some(dir) = &args.out_dir {
    emit(&reference, "Reference", &dir.join("ref"), canvas.as_ref(), visualizer.as_ref())?;
  }

  let report = ComparisonReport::compare(&candidate, &reference, args.top);
  println!();
  print!("{}", report);

  if args.strict && (!report.is_consistent() || report.positional_mismatches() > 0) {
    bail!(
      "检测结果不一致: 数量 {} vs {}, 前 {} 条中 {} 条位置不匹配",
      report.candidate_count,
      report.reference_count,
      report.rows.len(),
      report.positional_mismatches()
    );
  }
  Ok(())
}
