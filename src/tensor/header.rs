// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/tensor/header.rs - 张量的 C 头文件文本输出
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

//! 仅用于查看或直接嵌入固件源码的文本格式，引擎的二进制路径不使用它。
//! 浮点数按 C 的 `%.8e` 风格输出，下游逐位比较依赖这一格式。

use std::io::Write;

use super::{TensorData, TensorError, TensorRecord};

const TEST_VECTOR_VALUES_PER_LINE: usize = 8;

/// 将参数名转换为合法的 C 标识符，例如 `model.0.conv.weight` -> `model_0_conv_weight`
pub fn sanitize_c_identifier(name: &str) -> String {
  let mut ident = String::with_capacity(name.len());
  for ch in name.chars() {
    let ch = if ch.is_ascii_alphanumeric() || ch == '_' {
      ch
    } else {
      '_'
    };
    if ch == '_' && ident.ends_with('_') {
      continue;
    }
    ident.push(ch);
  }

  let ident = ident.trim_matches('_');
  if ident.is_empty() {
    "param".to_string()
  } else if ident.starts_with(|c: char| c.is_ascii_digit()) {
    format!("p_{}", ident)
  } else {
    ident.to_string()
  }
}

/// 科学计数法，小数 8 位，指数带符号且至少两位：`1.00000000e+00`
pub fn format_c_float(value: f32) -> String {
  if value.is_nan() {
    return "NAN".to_string();
  }
  if value.is_infinite() {
    return if value > 0.0 { "INFINITY" } else { "-INFINITY" }.to_string();
  }

  let formatted = format!("{:.8e}", value as f64);
  match formatted.split_once('e') {
    Some((mantissa, exponent)) => {
      let exponent: i32 = exponent.parse().unwrap_or(0);
      let sign = if exponent < 0 { '-' } else { '+' };
      format!("{}e{}{:02}f", mantissa, sign, exponent.abs())
    }
    None => format!("{}f", formatted),
  }
}

fn format_shape(shape: &[u32]) -> String {
  // 与 Python 元组的写法一致: (), (3,), (16, 3, 6, 6)
  match shape {
    [] => "()".to_string(),
    [dim] => format!("({},)", dim),
    dims => format!(
      "({})",
      dims
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
    ),
  }
}

#[derive(Debug, Clone)]
pub struct WeightsHeaderOptions {
  pub guard: String,
  pub source: Option<String>,
}

impl Default for WeightsHeaderOptions {
  fn default() -> Self {
    Self {
      guard: "WEIGHTS_H_".to_string(),
      source: None,
    }
  }
}

/// 每个张量输出一个数组声明以及元素数、各维度的宏，返回写出的张量数量
pub fn write_weights_header<'a, W, I>(
  writer: &mut W,
  records: I,
  options: &WeightsHeaderOptions,
) -> Result<usize, TensorError>
where
  W: Write,
  I: IntoIterator<Item = &'a TensorRecord>,
{
  let guard = &options.guard;
  writeln!(writer, "#ifndef {}", guard)?;
  writeln!(writer, "#define {}", guard)?;
  writeln!(writer)?;
  writeln!(writer, "// Auto-generated by qiaojie export-weights")?;
  if let Some(source) = &options.source {
    writeln!(writer, "// Source: {}", source)?;
  }
  writeln!(writer)?;
  writeln!(writer, "#include <stdint.h>")?;
  writeln!(writer, "#include <math.h>")?;
  writeln!(writer)?;

  let mut exported = 0usize;
  for record in records {
    let ident = sanitize_c_identifier(record.name());
    let macro_name = ident.to_uppercase();
    let elems = record.num_elements();

    writeln!(
      writer,
      "// {}  shape={}  elems={}",
      record.name(),
      format_shape(record.shape()),
      elems
    )?;

    match record.data() {
      TensorData::F32(values) => {
        write!(writer, "static const float {}[{}] = {{ ", ident, elems)?;
        write_joined(writer, values.iter().map(|&v| format_c_float(v)))?;
      }
      TensorData::U64(values) => {
        write!(writer, "static const uint64_t {}[{}] = {{ ", ident, elems)?;
        write_joined(writer, values.iter().map(|v| format!("{}ULL", v)))?;
      }
    }
    writeln!(writer, " }};")?;

    writeln!(writer, "#define {}_ELEMS ({})", macro_name, elems)?;
    for (axis, dim) in record.shape().iter().enumerate() {
      writeln!(writer, "#define {}_DIM{} ({})", macro_name, axis, dim)?;
    }
    writeln!(writer)?;
    exported += 1;
  }

  writeln!(writer, "// Exported tensors: {}", exported)?;
  writeln!(writer)?;
  writeln!(writer, "#endif // {}", guard)?;
  Ok(exported)
}

fn write_joined<W: Write>(
  writer: &mut W,
  items: impl Iterator<Item = String>,
) -> std::io::Result<()> {
  for (i, item) in items.enumerate() {
    if i > 0 {
      writer.write_all(b", ")?;
    }
    writer.write_all(item.as_bytes())?;
  }
  Ok(())
}

/// 测试向量的借用视图：NCHW 形状加 float32 数据
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestVector<'a> {
  pub shape: [u32; 4],
  pub values: &'a [f32],
}

impl<'a> TryFrom<&'a TensorRecord> for TestVector<'a> {
  type Error = TensorError;

  fn try_from(record: &'a TensorRecord) -> Result<Self, Self::Error> {
    let shape = <[u32; 4]>::try_from(record.shape()).map_err(|_| TensorError::MalformedHeader {
      field: format!("{} shape", record.name()),
      offset: 0,
      reason: format!("测试向量需要 NCHW 四维张量, 实际形状 {:?}", record.shape()),
    })?;
    match record.data() {
      TensorData::F32(values) => Ok(Self { shape, values }),
      TensorData::U64(_) => Err(TensorError::MalformedHeader {
        field: record.name().to_string(),
        offset: 0,
        reason: "测试向量只支持 float32".to_string(),
      }),
    }
  }
}

fn write_test_vector_array<W: Write>(
  writer: &mut W,
  name: &str,
  values: &[f32],
) -> std::io::Result<()> {
  writeln!(writer, "static const float {}[{}] = {{", name, values.len())?;
  for (i, &value) in values.iter().enumerate() {
    write!(writer, "{},", format_c_float(value))?;
    if (i + 1) % TEST_VECTOR_VALUES_PER_LINE == 0 {
      writeln!(writer)?;
    } else {
      write!(writer, " ")?;
    }
  }
  writeln!(writer)?;
  writeln!(writer, "}};")?;
  writeln!(writer)?;
  Ok(())
}

fn write_nchw_defines<W: Write>(
  writer: &mut W,
  prefix: &str,
  dims: [u32; 4],
) -> std::io::Result<()> {
  for (axis, dim) in ["N", "C", "H", "W"].iter().zip(dims) {
    writeln!(writer, "#define {}_{} {}", prefix, axis, dim)?;
  }
  writeln!(writer)
}

/// 逐层测试向量头文件：输入张量加上每一层的输出，`tag` 例如 `l0_23`
pub fn write_test_vector_header<W: Write>(
  writer: &mut W,
  tag: &str,
  input: TestVector<'_>,
  layers: &[TestVector<'_>],
) -> std::io::Result<()> {
  let tag_upper = sanitize_c_identifier(tag).to_uppercase();
  let tag_lower = sanitize_c_identifier(tag).to_lowercase();
  let guard = format!("TEST_VECTORS_{}_H", tag_upper);

  writeln!(writer, "#ifndef {}", guard)?;
  writeln!(writer, "#define {}", guard)?;
  writeln!(writer)?;
  writeln!(writer, "// Auto-generated by qiaojie capture-layers")?;
  writeln!(writer)?;

  write_nchw_defines(writer, &format!("TV_{}_X", tag_upper), input.shape)?;
  write_test_vector_array(writer, &format!("tv_{}_x", tag_lower), input.values)?;

  for (index, layer) in layers.iter().enumerate() {
    writeln!(writer, "// Layer {}", index)?;
    write_nchw_defines(writer, &format!("TV_L{}", index), layer.shape)?;
    write_test_vector_array(writer, &format!("tv_l{}_out", index), layer.values)?;
  }

  writeln!(writer, "#endif // {}", guard)?;
  Ok(())
}
