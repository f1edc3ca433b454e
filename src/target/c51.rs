use std::path::PathBuf;

use super::{FamilyContext, TargetFamily};
use crate::config::{Platform, ToolName};
use crate::debug_println;
use crate::xml::XmlValue;

/// 8051 系列关键字的占位定义，两个工具链共用
const C5X_KEYWORDS: &[&str] = &[
    "reentrant=",
    "compact=",
    "small=",
    "large=",
    "data=",
    "idata=",
    "pdata=",
    "bdata=",
    "xdata=",
    "code=",
    "bit=char",
    "sbit=char",
    "sfr=char",
    "sfr16=int",
    "sfr32=int",
    "interrupt=",
    "using=",
    "_at_=",
    "_priority_=",
    "_task_=",
];

/// C251 额外的存储类型
const C251_EXTRA_KEYWORDS: &[&str] = &["edata=", "far="];

/// C51 与 C251 的工程结构只在几个键名上不同
#[derive(Debug, Clone, Copy)]
struct C5xLayout {
    platform: Platform,
    tool: ToolName,
    /// `TargetOption` 下的节点，`Target51` / `Target251`
    option_key: &'static str,
    /// 编译器节点，`C51` / `C251`
    compiler_key: &'static str,
    tool_macros: [&'static str; 2],
    extra_keywords: &'static [&'static str],
}

/// C51 / C251 工具链
#[derive(Debug, Clone, Copy)]
pub struct C5xFamily {
    layout: C5xLayout,
}

impl C5xFamily {
    pub fn c51() -> Self {
        Self {
            layout: C5xLayout {
                platform: Platform::C51,
                tool: ToolName::C51,
                option_key: "Target51",
                compiler_key: "C51",
                tool_macros: ["__C51__", "__VSCODE_C51__"],
                extra_keywords: &[],
            },
        }
    }

    pub fn c251() -> Self {
        Self {
            layout: C5xLayout {
                platform: Platform::C251,
                tool: ToolName::C251,
                option_key: "Target251",
                compiler_key: "C251",
                tool_macros: ["__C251__", "__VSCODE_C251__"],
                extra_keywords: C251_EXTRA_KEYWORDS,
            },
        }
    }

    fn various_control(&self, target: &XmlValue, key: &str) -> String {
        target
            .text_at(&[
                "TargetOption",
                self.layout.option_key,
                self.layout.compiler_key,
                "VariousControls",
                key,
            ])
            .unwrap_or_default()
    }
}

impl TargetFamily for C5xFamily {
    fn keil_platform(&self) -> Platform {
        self.layout.platform
    }

    fn check_project(&self, target: &XmlValue) -> Result<(), String> {
        let found = target
            .at(&["TargetOption", self.layout.option_key, self.layout.compiler_key])
            .is_some();
        if !found {
            return Err(format!(
                "This uVision project is not a {} project, but have a 'uvproj' suffix!",
                self.layout.compiler_key
            ));
        }
        Ok(())
    }

    fn get_tool_name(&self, _target: &XmlValue) -> ToolName {
        self.layout.tool
    }

    fn get_inc_string(&self, target: &XmlValue) -> String {
        self.various_control(target, "IncludePath")
    }

    fn get_define_string(&self, target: &XmlValue) -> String {
        self.various_control(target, "Define")
    }

    fn get_sys_defines(&self, _ctx: &FamilyContext<'_>, _target: &XmlValue) -> Vec<String> {
        self.layout
            .tool_macros
            .iter()
            .chain(C5X_KEYWORDS)
            .chain(self.layout.extra_keywords)
            .map(|m| m.to_string())
            .collect()
    }

    /// `<root>/C51/INC`，以及存在时的 `INC/<Vendor>`
    fn get_system_includes(&self, ctx: &FamilyContext<'_>, target: &XmlValue) -> Vec<PathBuf> {
        if !ctx.toolchain.root.is_dir() {
            debug_println!(
                "[DEBUG c51] Keil root missing: {}",
                ctx.toolchain.root.display()
            );
            return Vec::new();
        }

        let inc_dir = ctx.toolchain.include_root(self.layout.tool);
        let mut dirs = vec![inc_dir.clone()];
        if let Some(vendor) = target
            .text_at(&["TargetOption", "TargetCommonOption", "Vendor"])
            .filter(|v| !v.trim().is_empty())
        {
            let vendor_dir = inc_dir.join(vendor.trim());
            if vendor_dir.is_dir() {
                dirs.push(vendor_dir);
            }
        }
        dirs
    }

    fn get_c_standard(&self, _target: &XmlValue) -> String {
        "c89".to_string()
    }

    fn get_cpp_standard(&self, _target: &XmlValue) -> String {
        "c++17".to_string()
    }

    fn get_intellisense_mode(&self, _target: &XmlValue) -> String {
        "${default}".to_string()
    }
}
