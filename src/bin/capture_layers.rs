// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/bin/capture_layers.rs - 按拓扑回放逐层输出并生成测试向量
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

use qiaojie::{
  capture::{LayerTopology, capture, layer_record_name},
  model::ReplayModel,
  tensor::read_container_file,
  utils::write_atomically,
};

/// 用拼接拓扑回放录制的逐层输出，校验拓扑并重新导出
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 录制的逐层输出 (input + layer_NN)
  #[arg(long, value_name = "ACTIVATIONS")]
  pub activations: PathBuf,
  /// 拼接拓扑 JSON
  #[arg(long, value_name = "TOPOLOGY")]
  pub topology: PathBuf,
  /// 输出的张量容器
  #[arg(long, value_name = "OUTPUT")]
  pub out: PathBuf,
  /// 可选的 C 测试向量头文件
  #[arg(long, value_name = "HEADER")]
  pub header: Option<PathBuf>,
  /// 头文件标签，默认 l0_<最后一层>
  #[arg(long, value_name = "TAG")]
  pub tag: Option<String>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let topology = LayerTopology::load(&args.topology)
    .with_context(|| format!("无法读取拓扑 {}", args.topology.display()))?;
  let mut model = {
    let container = read_container_file(&args.activations)
      .with_context(|| format!("无法读取 {}", args.activations.display()))?;
    ReplayModel::new(&container, topology.merge_layers())?
  };
  let input = model.input().clone();
  let captured = capture(&mut model, &topology, input)?;

  captured
    .write_container_file(&args.out)
    .with_context(|| format!("无法写入 {}", args.out.display()))?;
  info!("已写入 {}", args.out.display());

  if let Some(header) = &args.header {
    let tag = args
      .tag
      .clone()
      .unwrap_or_else(|| format!("l0_{}", captured.outputs.len().saturating_sub(1)));
    write_atomically::<std::io::Error, _>(header, |file| captured.write_test_vectors(file, &tag))
      .with_context(|| format!("无法写入 {}", header.display()))?;
    println!("Wrote header: {}", header.display());
  }

  println!("Input: {:?}", captured.input.shape());
  for (index, output) in captured.outputs.iter().enumerate() {
    println!("{}: {:?}", layer_record_name(index), output.shape());
  }
  println!("Wrote: {}", args.out.display());
  Ok(())
}
