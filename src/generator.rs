//! IntelliSense 配置（`.vscode/c_cpp_properties.json`）与 `compile_commands.json` 的生成
//!
//! 两个文件都可能被多个目标、多个工程共享：只替换当前配置名对应的条目，
//! 其它条目原样保留。序列化结果与磁盘内容一致时不写文件。

use std::collections::BTreeSet;
use std::path::Path;

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Value, json};

use crate::debug_println;
use crate::error::KeilError;
use crate::groups::FileGroup;
use crate::models::{CompileCommand, CppProperty};
use crate::utils::{get_short_path, path_to_slash};

const CPP_PROPERTIES_VERSION: u64 = 4;

/// compile_commands 中模拟 armclang 调用的固定参数
const COMPILE_ARGS: [&str; 2] = ["--target=arm-none-eabi", "-Wno-arm-asm-syntax"];

const C_EXTENSIONS: [&str; 1] = ["c"];
const CPP_EXTENSIONS: [&str; 3] = ["cpp", "cc", "cxx"];

/// 4 空格缩进的 JSON
pub fn to_pretty_json<T: Serialize>(value: &T) -> Result<String, KeilError> {
    let mut buf = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn read_existing(path: &Path) -> Option<String> {
    if path.is_file() {
        std::fs::read_to_string(path).ok()
    } else {
        None
    }
}

/// 内容与磁盘上一致时跳过写入，返回是否真正写入
fn write_if_changed(path: &Path, existing: Option<&str>, content: &str) -> Result<bool, KeilError> {
    if existing == Some(content) {
        debug_println!("[DEBUG generator] {} unchanged, skip writing", path.display());
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| KeilError::io(parent, e))?;
    }
    std::fs::write(path, content).map_err(|e| KeilError::io(path, e))?;
    debug_println!("[DEBUG generator] Wrote {}", path.display());
    Ok(true)
}

/// 将配置合并进已有的 c_cpp_properties 文档；已有内容无法解析时重新生成
pub fn merge_cpp_properties(existing: Option<&str>, property: &CppProperty) -> Result<String, KeilError> {
    let mut doc = existing
        .and_then(|text| match serde_json::from_str::<Value>(text) {
            Ok(value) if value.is_object() => Some(value),
            Ok(_) => None,
            Err(e) => {
                eprintln!("Warning: c_cpp_properties.json parse error: {}", e);
                None
            }
        })
        .unwrap_or_else(|| json!({ "configurations": [], "version": CPP_PROPERTIES_VERSION }));

    let entry = serde_json::to_value(property)?;
    if let Value::Object(map) = &mut doc {
        let configurations = map
            .entry("configurations")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !configurations.is_array() {
            *configurations = Value::Array(Vec::new());
        }
        if let Value::Array(list) = configurations {
            let index = list
                .iter()
                .position(|conf| conf.get("name").and_then(Value::as_str) == Some(property.name.as_str()));
            match index {
                Some(i) => list[i] = entry,
                None => list.push(entry),
            }
        }
        map.entry("version").or_insert(json!(CPP_PROPERTIES_VERSION));
    }

    to_pretty_json(&doc)
}

/// 更新 `c_cpp_properties.json`，返回是否写入了磁盘
pub fn update_cpp_properties(path: &Path, property: &CppProperty) -> Result<bool, KeilError> {
    let existing = read_existing(path);
    let content = merge_cpp_properties(existing.as_deref(), property)?;
    write_if_changed(path, existing.as_deref(), &content)
}

/// 生成编译命令列表：每个文件组内按 (目录, 扩展名) 合并为一条通配条目
pub fn generate_compile_commands(
    config_name: &str,
    compiler_path: &Path,
    c_standard: &str,
    cpp_standard: &str,
    defines: &[String],
    absolute_includes: &[String],
    groups: &[FileGroup],
) -> Vec<CompileCommand> {
    debug_println!("[DEBUG generator] Generating compile commands for '{}'", config_name);

    let compiler = get_short_path(&path_to_slash(compiler_path));
    debug_println!("[DEBUG generator] Compiler for commands: {}", compiler);

    let define_flags: Vec<String> = defines.iter().map(|d| format!("-D{}", d)).collect();
    let include_flags: Vec<String> = absolute_includes.iter().map(|i| format!("-I{}", i)).collect();

    let mut commands = Vec::new();
    for group in groups {
        // BTreeSet 保证同一输入下条目顺序稳定
        let mut patterns: BTreeSet<(String, String)> = BTreeSet::new();
        for source in group.sources.iter().filter(|s| s.enabled) {
            let Some(ext) = source.path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase())
            else {
                continue;
            };
            if !C_EXTENSIONS.contains(&ext.as_str()) && !CPP_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }
            let dir = source.path.parent().map(path_to_slash).unwrap_or_default();
            patterns.insert((dir, ext));
        }

        for (dir, ext) in patterns {
            let std = if CPP_EXTENSIONS.contains(&ext.as_str()) {
                cpp_standard
            } else {
                c_standard
            };
            let file = format!("{}/*.{}", dir, ext);

            let mut arguments = vec![compiler.clone()];
            arguments.extend(COMPILE_ARGS.iter().map(|a| a.to_string()));
            arguments.push(format!("-std={}", std));
            arguments.extend(define_flags.iter().cloned());
            arguments.extend(include_flags.iter().cloned());
            arguments.push("-c".to_string());
            arguments.push(file.clone());

            commands.push(CompileCommand {
                configuration: config_name.to_string(),
                directory: dir,
                file,
                arguments,
            });
        }
    }

    debug_println!("[DEBUG generator] {} compile command entries", commands.len());
    commands
}

/// 替换同名配置的条目，保留其它配置
pub fn merge_compile_commands(
    existing: Option<&str>,
    config_name: &str,
    entries: &[CompileCommand],
) -> Result<String, KeilError> {
    let mut list: Vec<Value> = existing
        .and_then(|text| serde_json::from_str::<Vec<Value>>(text).ok())
        .unwrap_or_default();

    list.retain(|entry| entry.get("configuration").and_then(Value::as_str) != Some(config_name));
    for entry in entries {
        list.push(serde_json::to_value(entry)?);
    }
    to_pretty_json(&list)
}

/// 更新工作区根目录下的 `compile_commands.json`，返回是否写入了磁盘
pub fn update_compile_commands(
    path: &Path,
    config_name: &str,
    entries: &[CompileCommand],
) -> Result<bool, KeilError> {
    let existing = read_existing(path);
    let content = merge_compile_commands(existing.as_deref(), config_name, entries)?;
    write_if_changed(path, existing.as_deref(), &content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::Source;
    use std::path::PathBuf;

    fn property(name: &str, defines: &[&str]) -> CppProperty {
        CppProperty {
            name: name.to_string(),
            c_standard: "c99".into(),
            cpp_standard: "c++11".into(),
            compiler_path: None,
            compiler_args: None,
            include_path: vec!["Core/Inc".into()],
            defines: defines.iter().map(|d| d.to_string()).collect(),
            intelli_sense_mode: "gcc-arm".into(),
        }
    }

    #[test]
    fn test_cpp_properties_replace_by_name() {
        let first = merge_cpp_properties(None, &property("Debug", &["A"])).unwrap();
        let second = merge_cpp_properties(Some(&first), &property("Release", &["B"])).unwrap();
        let third = merge_cpp_properties(Some(&second), &property("Debug", &["C"])).unwrap();

        let doc: Value = serde_json::from_str(&third).unwrap();
        let confs = doc["configurations"].as_array().unwrap();
        assert_eq!(confs.len(), 2);
        assert_eq!(confs[0]["name"], "Debug");
        assert_eq!(confs[0]["defines"], json!(["C"]));
        assert_eq!(confs[1]["name"], "Release");
        assert_eq!(doc["version"], 4);
        assert!(confs[0].get("compilerPath").is_none());
        assert!(third.contains("\n    \"configurations\""));
    }

    #[test]
    fn test_update_skips_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".vscode").join("c_cpp_properties.json");
        assert!(update_cpp_properties(&path, &property("Debug", &["A"])).unwrap());
        assert!(!update_cpp_properties(&path, &property("Debug", &["A"])).unwrap());
        assert!(update_cpp_properties(&path, &property("Debug", &["B"])).unwrap());
    }

    #[test]
    fn test_compile_commands_group_by_dir_and_extension() {
        let groups = vec![FileGroup {
            name: "App".into(),
            disabled: false,
            sources: vec![
                Source::new(PathBuf::from("/ws/src/main.c"), true),
                Source::new(PathBuf::from("/ws/src/util.c"), true),
                Source::new(PathBuf::from("/ws/src/drv.cpp"), true),
                Source::new(PathBuf::from("/ws/src/startup.s"), true),
                Source::new(PathBuf::from("/ws/old/legacy.c"), false),
            ],
        }];
        let commands = generate_compile_commands(
            "Debug",
            Path::new("/keil/ARM/ARMCLANG/bin/armclang"),
            "c99",
            "c++11",
            &["USE_HAL".to_string()],
            &["/ws/inc".to_string()],
            &groups,
        );

        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].file, "/ws/src/*.c");
        assert_eq!(commands[0].directory, "/ws/src");
        assert_eq!(
            commands[0].arguments,
            vec![
                "/keil/ARM/ARMCLANG/bin/armclang",
                "--target=arm-none-eabi",
                "-Wno-arm-asm-syntax",
                "-std=c99",
                "-DUSE_HAL",
                "-I/ws/inc",
                "-c",
                "/ws/src/*.c",
            ]
        );
        assert_eq!(commands[1].file, "/ws/src/*.cpp");
        assert!(commands[1].arguments.contains(&"-std=c++11".to_string()));
    }

    #[test]
    fn test_compile_commands_keep_other_configurations() {
        let entry = |conf: &str| CompileCommand {
            configuration: conf.into(),
            directory: "/ws".into(),
            file: "/ws/*.c".into(),
            arguments: vec!["armclang".into()],
        };
        let first = merge_compile_commands(None, "A", &[entry("A")]).unwrap();
        let second = merge_compile_commands(Some(&first), "B", &[entry("B")]).unwrap();
        let third = merge_compile_commands(Some(&second), "A", &[entry("A"), entry("A")]).unwrap();

        let list: Vec<CompileCommand> = serde_json::from_str(&third).unwrap();
        let configs: Vec<&str> = list.iter().map(|c| c.configuration.as_str()).collect();
        assert_eq!(configs, vec!["B", "A", "A"]);
    }
}
