// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/utils.rs - 文件辅助工具
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

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
#[error("文件不存在: {}", .0.display())]
pub struct MissingFile(pub PathBuf);

pub fn ensure_exists(path: &Path) -> Result<(), MissingFile> {
  if path.exists() {
    Ok(())
  } else {
    Err(MissingFile(path.to_path_buf()))
  }
}

fn temporary_sibling(path: &Path) -> PathBuf {
  let mut name = path
    .file_name()
    .map(|name| name.to_os_string())
    .unwrap_or_default();
  name.push(".partial");
  path.with_file_name(name)
}

/// 先写入同目录下的临时文件，成功后再重命名为目标路径；
/// 失败时删除临时文件，目标路径保持原样。
pub fn write_atomically<E, F>(path: &Path, write: F) -> Result<(), E>
where
  E: From<std::io::Error>,
  F: FnOnce(&mut BufWriter<File>) -> Result<(), E>,
{
  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent)?;
  }

  let partial = temporary_sibling(path);
  let result = File::create(&partial)
    .map_err(E::from)
    .and_then(|file| {
      let mut writer = BufWriter::new(file);
      write(&mut writer)?;
      writer.flush()?;
      Ok(())
    })
    .and_then(|_| std::fs::rename(&partial, path).map_err(E::from));

  match result {
    Ok(()) => {
      debug!("已写入文件: {}", path.display());
      Ok(())
    }
    Err(e) => {
      if partial.exists()
        && let Err(remove_err) = std::fs::remove_file(&partial)
      {
        warn!("无法删除临时文件 {}: {}", partial.display(), remove_err);
      }
      Err(e)
    }
  }
}
