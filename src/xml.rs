//! uVision / CMSIS-Pack XML 文档加载
//!
//! 将 XML 转为通用的属性树：属性以 `@_` 前缀存放，文本节点存放在 `#text`，
//! 同名兄弟元素出现一次时是单个对象，出现多次时是有序数组。
//! uVision 的文件格式本身没有稳定的 schema，调用方在每个访问点都要用
//! [`as_list`] 处理单个/数组两种形态。

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::path::Path;

use roxmltree::{Document, Node, ParsingOptions};

use crate::debug_println;
use crate::error::KeilError;

pub const ATTR_PREFIX: &str = "@_";
pub const TEXT_KEY: &str = "#text";

/// 解析后的 XML 值
#[derive(Debug, Clone, PartialEq)]
pub enum XmlValue {
    Object(BTreeMap<String, XmlValue>),
    Array(Vec<XmlValue>),
    Str(String),
    Number(f64),
}

/// 解析约定
#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub attribute_prefix: String,
    pub text_key: String,
    /// 对属性值和文本再做一次 HTML 实体解码（.pdsc 中常见二次转义）
    pub decode_entities: bool,
    /// 这些元素的内容按原始字符串保留，不再展开
    pub stop_nodes: Vec<String>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            attribute_prefix: ATTR_PREFIX.to_string(),
            text_key: TEXT_KEY.to_string(),
            decode_entities: false,
            stop_nodes: vec!["parse-me-as-string".to_string()],
        }
    }
}

impl ParseOptions {
    /// CMSIS-Pack 描述文件使用的选项
    pub fn pack_descriptor() -> Self {
        Self {
            decode_entities: true,
            ..Self::default()
        }
    }
}

impl XmlValue {
    /// 取对象的子键
    pub fn get(&self, key: &str) -> Option<&XmlValue> {
        match self {
            XmlValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// 按路径逐级取值，例如 `["TargetOption", "TargetArmAds", "Cads"]`
    pub fn at(&self, path: &[&str]) -> Option<&XmlValue> {
        path.iter().try_fold(self, |value, key| value.get(key))
    }

    /// 取属性值（默认 `@_` 前缀）
    pub fn attr(&self, name: &str) -> Option<String> {
        self.get(&format!("{}{}", ATTR_PREFIX, name))
            .and_then(XmlValue::text)
    }

    /// 文本形式：字符串、数字，或对象的 `#text`
    pub fn text(&self) -> Option<String> {
        match self {
            XmlValue::Str(s) => Some(s.clone()),
            XmlValue::Number(n) => Some(format_number(*n)),
            XmlValue::Object(map) => map.get(TEXT_KEY).and_then(XmlValue::text),
            XmlValue::Array(_) => None,
        }
    }

    /// 按路径取文本
    pub fn text_at(&self, path: &[&str]) -> Option<String> {
        self.at(path).and_then(XmlValue::text)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            XmlValue::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            XmlValue::Str(s) => s.trim().parse().ok(),
            XmlValue::Object(map) => map.get(TEXT_KEY).and_then(XmlValue::as_i64),
            _ => None,
        }
    }

    /// 空元素（`<Files/>`）解析为空字符串，这里视为不存在
    pub fn is_empty(&self) -> bool {
        match self {
            XmlValue::Str(s) => s.is_empty(),
            XmlValue::Object(map) => map.is_empty(),
            XmlValue::Array(items) => items.is_empty(),
            XmlValue::Number(_) => false,
        }
    }

    /// 单个值视为只有一个元素的列表
    pub fn as_list(&self) -> Vec<&XmlValue> {
        match self {
            XmlValue::Array(items) => items.iter().collect(),
            other => vec![other],
        }
    }
}

/// 单个/数组/缺失 统一为列表；空元素得到空列表
pub fn as_list(value: Option<&XmlValue>) -> Vec<&XmlValue> {
    match value {
        None => Vec::new(),
        Some(v) if v.is_empty() => Vec::new(),
        Some(v) => v.as_list().into_iter().filter(|item| !item.is_empty()).collect(),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// 数字样式的文本转为数字；只在能无损还原时转换（"1.10"、"007" 保持字符串）
fn coerce(text: &str) -> XmlValue {
    let looks_numeric = {
        let digits = text.strip_prefix('-').unwrap_or(text);
        !digits.is_empty()
            && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
            && digits.chars().filter(|c| *c == '.').count() <= 1
            && !digits.starts_with('.')
            && !digits.ends_with('.')
    };
    if looks_numeric {
        if let Ok(n) = text.parse::<f64>() {
            if format_number(n) == text {
                return XmlValue::Number(n);
            }
        }
    }
    XmlValue::Str(text.to_string())
}

/// 解码 HTML 实体（roxmltree 已处理一层 XML 实体，这里处理二次转义与 &nbsp; 等）
pub fn decode_entities(input: &str) -> Cow<'_, str> {
    if !input.contains('&') {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let decoded = rest.find(';').and_then(|end| {
            let entity = &rest[1..end];
            let ch = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// 解析 XML 文本，返回以根元素名为键的对象
pub fn parse_xml(text: &str, options: &ParseOptions) -> Result<XmlValue, roxmltree::Error> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut parsing = ParsingOptions::default();
    parsing.allow_dtd = true;
    let doc = Document::parse_with_options(text, parsing)?;
    let root = doc.root_element();

    let mut map = BTreeMap::new();
    map.insert(
        root.tag_name().name().to_string(),
        convert_node(root, options, text),
    );
    Ok(XmlValue::Object(map))
}

/// 读取并解析 XML 文件；非 UTF-8 内容按 GBK 解码（旧版 uVision 工程）
pub fn load_xml_file(path: &Path, options: &ParseOptions) -> Result<XmlValue, KeilError> {
    debug_println!("[DEBUG xml] Loading {}", path.display());
    let bytes = std::fs::read(path).map_err(|e| KeilError::io(path, e))?;
    parse_xml(&decode_text(bytes), options).map_err(|e| KeilError::parse(path, e.to_string()))
}

/// 文件内容转文本：优先 UTF-8，失败时按 GBK 解码
pub fn decode_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => {
            let (decoded, _, _) = encoding_rs::GBK.decode(err.as_bytes());
            decoded.into_owned()
        }
    }
}

fn convert_node(node: Node<'_, '_>, options: &ParseOptions, input: &str) -> XmlValue {
    let tag = node.tag_name().name();
    if options.stop_nodes.iter().any(|s| s == tag) {
        return XmlValue::Str(raw_inner_text(node, input).to_string());
    }

    let decode = |s: &str| -> String {
        if options.decode_entities {
            decode_entities(s).into_owned()
        } else {
            s.to_string()
        }
    };

    let mut map: BTreeMap<String, XmlValue> = BTreeMap::new();
    for attr in node.attributes() {
        map.insert(
            format!("{}{}", options.attribute_prefix, attr.name()),
            XmlValue::Str(decode(attr.value())),
        );
    }

    let mut text = String::new();
    for child in node.children() {
        if child.is_element() {
            let value = convert_node(child, options, input);
            match map.entry(child.tag_name().name().to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(value);
                }
                Entry::Occupied(mut slot) => match slot.get_mut() {
                    XmlValue::Array(items) => items.push(value),
                    existing => {
                        let first = std::mem::replace(existing, XmlValue::Array(Vec::new()));
                        *existing = XmlValue::Array(vec![first, value]);
                    }
                },
            }
        } else if child.is_text() {
            text.push_str(child.text().unwrap_or(""));
        }
    }

    let text = decode(text.trim());
    if map.is_empty() {
        if text.is_empty() {
            XmlValue::Str(String::new())
        } else {
            coerce(&text)
        }
    } else {
        if !text.is_empty() {
            map.insert(options.text_key.clone(), coerce(&text));
        }
        XmlValue::Object(map)
    }
}

fn raw_inner_text<'a>(node: Node<'_, '_>, input: &'a str) -> &'a str {
    let raw = &input[node.range()];
    let start = raw.find('>').map(|p| p + 1).unwrap_or(raw.len());
    if raw[..start].ends_with("/>") {
        return "";
    }
    let end = raw.rfind("</").unwrap_or(raw.len()).max(start);
    &raw[start..end]
}
