// 该文件是 Poubelle 项目的一部分。
// src/lib.rs - 库主文件
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

pub mod frame;
pub mod input;
pub mod model;
pub mod output;
pub mod task;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

/// URL 查询参数格式错误
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("参数 '{key}' 的值无效: '{value}'")]
pub struct InvalidQueryParam {
  pub key: String,
  pub value: String,
}

/// 读取 URL 查询参数并解析为指定类型
///
/// 参数不存在时返回 `Ok(None)`，存在但无法解析时返回错误。
pub(crate) fn query_param<T: std::str::FromStr>(
  url: &url::Url,
  key: &str,
) -> Result<Option<T>, InvalidQueryParam> {
  match url.query_pairs().find(|(k, _)| k == key) {
    None => Ok(None),
    Some((_, value)) => value.parse::<T>().map(Some).map_err(|_| InvalidQueryParam {
      key: key.to_string(),
      value: value.into_owned(),
    }),
  }
}

/// 解码 URL 路径中的百分号转义，例如 `%20`
pub(crate) fn decoded_path(url: &url::Url) -> Result<String, std::string::FromUtf8Error> {
  urlencoding::decode(url.path()).map(|path| path.into_owned())
}

/// 转义 GStreamer 管道描述中双引号内的字符串
#[cfg(feature = "gstreamer")]
pub(crate) fn quote_location(location: &str) -> String {
  format!(
    "\"{}\"",
    location.replace('\\', "\\\\").replace('"', "\\\"")
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn query_param_absent_or_invalid() {
    let url = url::Url::parse("video:///tmp/a.webm?width=640&fps=abc").unwrap();
    assert_eq!(query_param::<u32>(&url, "width"), Ok(Some(640)));
    assert_eq!(query_param::<u32>(&url, "height"), Ok(None));
    let err = query_param::<f64>(&url, "fps").unwrap_err();
    assert_eq!(err.key, "fps");
    assert_eq!(err.value, "abc");
  }

  #[test]
  fn path_is_percent_decoded() {
    let url = url::Url::parse("image:///tmp/my%20bins/poubelle%C3%A9.png").unwrap();
    assert_eq!(decoded_path(&url).unwrap(), "/tmp/my bins/poubelleé.png");
  }

  #[cfg(feature = "gstreamer")]
  #[test]
  fn quoted_location_escapes_quotes() {
    assert_eq!(quote_location(r#"/tmp/a "b".mp4"#), r#""/tmp/a \"b\".mp4""#);
    assert_eq!(quote_location(r"/tmp/a\b"), r#""/tmp/a\\b""#);
  }
}
