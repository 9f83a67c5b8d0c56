// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/bin/export_weights.rs - 检查点导出为引擎权重
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
use url::Url;

use qiaojie::{
  FromUrl,
  checkpoint::{CheckpointSource, TrustPolicy},
  export::{ExportFormat, ExportOptions, export_weights},
};

/// 把检查点中的参数映射导出为引擎可读的权重文件
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检查点来源, 例如 json:///data/ckpt.json 或 weights:///data/weights.bin
  #[arg(long, value_name = "CHECKPOINT")]
  pub checkpoint: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub out: PathBuf,
  /// 输出格式: bin 或 header
  #[arg(long, value_name = "FORMAT", default_value = "bin")]
  pub format: ExportFormat,
  /// 只导出名称包含该子串的张量
  #[arg(long, value_name = "SUBSTR")]
  pub only: Option<String>,
  /// 最多导出的张量数量
  #[arg(long, value_name = "N")]
  pub max: Option<usize>,
  /// 允许展开检查点中的模块对象，仅用于可信来源
  #[arg(long)]
  pub trust_modules: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("检查点: {}", args.checkpoint);
  info!("输出路径: {}", args.out.display());

  let source = CheckpointSource::from_url(&args.checkpoint)?;
  let checkpoint = source
    .load()
    .with_context(|| format!("无法加载检查点 {}", args.checkpoint))?;

  let policy = if args.trust_modules {
    TrustPolicy::TrustModules
  } else {
    TrustPolicy::WeightsOnly
  };
  let state = checkpoint.resolve_state(policy)?;

  let options = ExportOptions {
    format: args.format,
    only: args.only,
    max: args.max,
    source: Some(args.checkpoint.to_string()),
  };
  let count = export_weights(&state, &args.out, &options)
    .with_context(|| format!("导出到 {} 失败", args.out.display()))?;

  println!("Tensors in checkpoint: {}", state.len());
  println!("Exported tensors:      {}", count);
  println!("Wrote: {}", args.out.display());
  Ok(())
}
