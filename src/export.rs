// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/export.rs - 将参数映射导出为引擎权重文件或 C 头文件
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

use std::path::Path;
use std::str::FromStr;

use thiserror::Error;
use tracing::{info, warn};

use crate::{
  checkpoint::{CheckpointError, StateDict},
  tensor::{
    ENGINE_MAX_NAME_LEN, ENGINE_MAX_RANK, TensorError, TensorRecord, TensorWriter,
    header::{WeightsHeaderOptions, write_weights_header},
  },
  utils::write_atomically,
};

#[derive(Error, Debug)]
pub enum ExportError {
  #[error("张量 {name} 超出引擎限制: {reason}")]
  EngineLimit { name: String, reason: String },
  #[error("未知的导出格式: {0}")]
  UnknownFormat(String),
  #[error("张量错误: {0}")]
  TensorError(#[from] TensorError),
  #[error("检查点错误: {0}")]
  CheckpointError(#[from] CheckpointError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
  /// 引擎直接读取的二进制容器
  #[default]
  Binary,
  /// 便于检查或直接编译进固件的 C 头文件
  Header,
}

impl FromStr for ExportFormat {
  type Err = ExportError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "bin" | "binary" => Ok(ExportFormat::Binary),
      "header" | "h" => Ok(ExportFormat::Header),
      other => Err(ExportError::UnknownFormat(other.to_string())),
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
  pub format: ExportFormat,
  /// 只导出名称包含该子串的张量
  pub only: Option<String>,
  /// 最多导出的张量数量
  pub max: Option<usize>,
  /// 写入头文件注释的来源描述
  pub source: Option<String>,
}

/// 按名称排序后应用过滤条件
pub fn select<'a>(state: &'a StateDict, options: &ExportOptions) -> Vec<&'a TensorRecord> {
  let filtered = state.iter().filter(|(name, _)| match &options.only {
    Some(pattern) => name.contains(pattern.as_str()),
    None => true,
  });
  match options.max {
    Some(max) => filtered.take(max).map(|(_, record)| record).collect(),
    None => filtered.map(|(_, record)| record).collect(),
  }
}

pub fn check_engine_limits(record: &TensorRecord) -> Result<(), ExportError> {
  if record.shape().len() > ENGINE_MAX_RANK {
    return Err(ExportError::EngineLimit {
      name: record.name().to_string(),
      reason: format!("维度数 {} 超过 {}", record.shape().len(), ENGINE_MAX_RANK),
    });
  }
  if record.name().len() > ENGINE_MAX_NAME_LEN {
    return Err(ExportError::EngineLimit {
      name: record.name().to_string(),
      reason: format!("名称长度 {} 字节超过 {}", record.name().len(), ENGINE_MAX_NAME_LEN),
    });
  }
  Ok(())
}

/// 导出选中的张量，返回写出的数量。任何错误都不会留下输出文件。
pub fn export_weights(
  state: &StateDict,
  out: &Path,
  options: &ExportOptions,
) -> Result<usize, ExportError> {
  let selected = select(state, options);
  for record in &selected {
    check_engine_limits(record)?;
  }
  if selected.is_empty() {
    warn!("过滤后没有可导出的张量");
  }

  match options.format {
    ExportFormat::Binary => {
      let count = u32::try_from(selected.len()).map_err(|_| ExportError::EngineLimit {
        name: String::from("<container>"),
        reason: format!("张量数量 {} 超出 u32 范围", selected.len()),
      })?;
      write_atomically::<ExportError, _>(out, |file| {
        let mut writer = TensorWriter::new(file, count)?;
        for record in &selected {
          writer.write_record(record)?;
        }
        writer.finish()?;
        Ok(())
      })?;
    }
    ExportFormat::Header => {
      let header_options = WeightsHeaderOptions {
        source: options.source.clone(),
        ..WeightsHeaderOptions::default()
      };
      write_atomically::<ExportError, _>(out, |file| {
        write_weights_header(file, selected.iter().copied(), &header_options)?;
        Ok(())
      })?;
    }
  }

  info!("已导出 {} 个张量到 {}", selected.len(), out.display());
  Ok(selected.len())
}
