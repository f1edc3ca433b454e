//! 编译器生成的 `.d` 依赖文件解析
//!
//! 两种格式：
//! - GNU/Makefile 规则（armclang）：`main.o: main.c \` 后接续行
//! - ARMCC：每行 `main.o: path`

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::debug_println;
use crate::utils::UniqueList;

/// `.d` 文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepDialect {
    Gnu,
    Armcc,
}

impl DepDialect {
    pub fn parse(&self, lines: &[&str]) -> Vec<String> {
        match self {
            DepDialect::Gnu => parse_gnu_ref_lines(lines),
            DepDialect::Armcc => parse_armcc_ref_lines(lines),
        }
    }
}

/// GNU 格式：去掉行尾 `\`，按前面不是 `\` 或 `:` 的空格切分，
/// 第一行的第一个片段（规则目标及紧随其后的源文件）跳过
pub fn parse_gnu_ref_lines(lines: &[&str]) -> Vec<String> {
    let mut refs = UniqueList::new();

    for (index, raw) in lines.iter().enumerate() {
        let line = raw.trim_end();
        let line = line.strip_suffix('\\').unwrap_or(line).trim();
        if line.is_empty() {
            continue;
        }

        let tokens = split_unescaped(line);
        let skip = if index == 0 { 1 } else { 0 };
        for token in tokens.into_iter().skip(skip) {
            refs.insert(token.replace("\\ ", " "));
        }
    }
    refs.into_vec()
}

fn split_unescaped(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev: Option<char> = None;

    for c in line.chars() {
        if c == ' ' && !matches!(prev, Some('\\') | Some(':')) {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
        prev = Some(c);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

const SOURCE_EXTENSIONS: [&str; 7] = ["c", "cpp", "cc", "cxx", "s", "asm", "a51"];

/// ARMCC 格式：每行按第一个 `": "` 切分取后半部分；
/// 首行如果指向源文件本身（ARMCC 的首行惯例）则跳过
pub fn parse_armcc_ref_lines(lines: &[&str]) -> Vec<String> {
    let mut refs = UniqueList::new();

    for (index, line) in lines.iter().enumerate() {
        let Some((_, path)) = line.split_once(": ") else {
            continue;
        };
        let path = path.trim();
        if path.is_empty() {
            continue;
        }
        if index == 0 && is_source_file(path) {
            continue;
        }
        refs.insert(path);
    }
    refs.into_vec()
}

fn is_source_file(path: &str) -> bool {
    Path::new(path)
        .extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            SOURCE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// 依赖文件解析缓存，键为 (输出目录, 源文件名去扩展名)
///
/// 条目从不单独失效；目标重新 load 时整个缓存被清空
#[derive(Debug, Default)]
pub struct DependencyCache {
    entries: HashMap<(PathBuf, String), Vec<String>>,
}

impl DependencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取 `<output_dir>/<stem>.d` 并交给 `parse`；文件不存在或读取失败时返回空列表（不缓存）
    pub fn refs_for<F>(&mut self, output_dir: &Path, stem: &str, parse: F) -> Vec<String>
    where
        F: FnOnce(&[&str]) -> Vec<String>,
    {
        let key = (output_dir.to_path_buf(), stem.to_string());
        if let Some(hit) = self.entries.get(&key) {
            return hit.clone();
        }

        let dep_file = output_dir.join(format!("{stem}.d"));
        let content = match std::fs::read(&dep_file) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => return Vec::new(),
        };
        let lines: Vec<&str> = content.lines().collect();
        let refs = parse(&lines);
        debug_println!(
            "[DEBUG deps] {} -> {} references",
            dep_file.display(),
            refs.len()
        );

        self.entries.insert(key, refs.clone());
        refs
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gnu_rule() {
        let lines = ["target.o: a.c \\", "  b.h c.h"];
        assert_eq!(parse_gnu_ref_lines(&lines), vec!["b.h", "c.h"]);
    }

    #[test]
    fn test_gnu_escaped_spaces_and_duplicates() {
        let lines = [
            "obj/main.o: src/main.c \\",
            "  inc/my\\ header.h \\",
            "  C:/Keil_v5/ARM/ARMCLANG/include/stdint.h \\",
            "  inc/my\\ header.h",
        ];
        assert_eq!(
            parse_gnu_ref_lines(&lines),
            vec!["inc/my header.h", "C:/Keil_v5/ARM/ARMCLANG/include/stdint.h"]
        );
    }

    #[test]
    fn test_armcc_lines() {
        let lines = ["foo.o: a.h", "  : b.h"];
        assert_eq!(parse_armcc_ref_lines(&lines), vec!["a.h", "b.h"]);
    }

    #[test]
    fn test_armcc_skips_source_header_line() {
        let lines = [
            ".\\Objects\\main.o: main.c",
            ".\\Objects\\main.o: .\\inc\\board.h",
            ".\\Objects\\main.o: C:\\Keil_v5\\ARM\\ARMCC\\include\\stdint.h",
            ".\\Objects\\main.o: .\\inc\\board.h",
        ];
        assert_eq!(
            parse_armcc_ref_lines(&lines),
            vec![
                ".\\inc\\board.h",
                "C:\\Keil_v5\\ARM\\ARMCC\\include\\stdint.h"
            ]
        );
    }

    #[test]
    fn test_cache_reads_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.d"), "main.o: main.c \\\n  a.h\n").unwrap();

        let mut cache = DependencyCache::new();
        assert_eq!(cache.refs_for(dir.path(), "main", parse_gnu_ref_lines), vec!["a.h"]);

        // 缓存命中，不会看到新内容
        std::fs::write(dir.path().join("main.d"), "main.o: main.c \\\n  b.h\n").unwrap();
        assert_eq!(cache.refs_for(dir.path(), "main", parse_gnu_ref_lines), vec!["a.h"]);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert_eq!(cache.refs_for(dir.path(), "main", parse_gnu_ref_lines), vec!["b.h"]);

        assert!(cache.refs_for(dir.path(), "missing", parse_gnu_ref_lines).is_empty());
        assert_eq!(cache.len(), 1);
    }
}
