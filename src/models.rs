use serde::{Deserialize, Serialize};

/// c_cpp_properties.json 中的一个配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CppProperty {
    pub name: String,
    pub c_standard: String,
    pub cpp_standard: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub compiler_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub compiler_args: Option<Vec<String>>,
    pub include_path: Vec<String>,
    pub defines: Vec<String>,
    pub intelli_sense_mode: String,
}

/// 编译命令结构，用于生成compile_commands.json
/// file 是按目录+扩展名合并后的通配模式，arguments 只用于描述，不会被执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileCommand {
    pub configuration: String,
    pub directory: String,
    pub file: String,
    pub arguments: Vec<String>,
}

/// `.vscode/keil_project_properties.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectProperties {
    #[serde(default)]
    pub project: ProjectEntry,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub active_target_name: Option<String>,
}
