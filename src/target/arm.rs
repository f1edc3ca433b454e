use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use super::{FamilyContext, TargetFamily};
use crate::config::{Platform, ToolName};
use crate::debug_println;
use crate::deps::DepDialect;
use crate::pack::{PackContext, PackResolution, resolve_includes_and_macros, rots_condition};
use crate::prober::arm_cpu_flag;
use crate::xml::{XmlValue, as_list};

/// ARMCC (AC5) 关键字与内建函数的占位定义
const ARMCC_MACROS: &[&str] = &[
    "__CC_ARM",
    "__arm__",
    "__align(x)=",
    "__ALIGNOF__(x)=",
    "__alignof__(x)=",
    "__asm(x)=",
    "__forceinline=",
    "__restrict=",
    "__global_reg(n)=",
    "__inline=",
    "__int64=long long",
    "__INTADDR__(expr)=0",
    "__irq=",
    "__packed=",
    "__pure=",
    "__smc(n)=",
    "__svc(n)=",
    "__svc_indirect(n)=",
    "__svc_indirect_r7(n)=",
    "__value_in_regs=",
    "__weak=",
    "__writeonly=",
    "__declspec(x)=",
    "__attribute__(x)=",
    "__nonnull__(x)=",
    "__register=",
    "__breakpoint(x)=",
    "__cdp(x,y,z)=",
    "__clrex()=",
    "__clz(x)=0U",
    "__current_pc()=0U",
    "__current_sp()=0U",
    "__disable_fiq()=",
    "__disable_irq()=",
    "__dmb(x)=",
    "__dsb(x)=",
    "__enable_fiq()=",
    "__enable_irq()=",
    "__fabs(x)=0.0",
    "__fabsf(x)=0.0f",
    "__force_loads()=",
    "__force_stores()=",
    "__isb(x)=",
    "__ldrex(x)=0U",
    "__ldrexd(x)=0U",
    "__ldrt(x)=0U",
    "__memory_changed()=",
    "__nop()=",
    "__pld(...)=",
    "__pli(...)=",
    "__qadd(x,y)=0",
    "__qdbl(x)=0",
    "__qsub(x,y)=0",
    "__rbit(x)=0U",
    "__rev(x)=0U",
    "__return_address()=0U",
    "__ror(x,y)=0U",
    "__schedule_barrier()=",
    "__semihost(x,y)=0",
    "__sev()=",
    "__sqrt(x)=0.0",
    "__sqrtf(x)=0.0f",
    "__ssat(x,y)=0",
    "__strex(x,y)=0U",
    "__strexd(x,y)=0",
    "__strt(x,y)=",
    "__swp(x,y)=0U",
    "__usat(x,y)=0U",
    "__wfe()=",
    "__wfi()=",
    "__yield()=",
    "__vfp_status(x,y)=0",
];

/// ARMCLANG (AC6) 关键字占位，内置宏另由编译器导出
const ARMCLANG_MACROS: &[&str] = &[
    "__alignof__(x)=",
    "__asm(x)=",
    "__asm__(x)=",
    "__forceinline=",
    "__restrict=",
    "__volatile__=",
    "__inline=",
    "__inline__=",
    "__declspec(x)=",
    "__attribute__(x)=",
    "__nonnull__(x)=",
    "__unaligned=",
    "__promise(x)=",
    "__irq=",
    "__swi=",
    "__weak=",
    "__register=",
    "__pure=",
    "__value_in_regs=",
    "__breakpoint(x)=",
    "__current_pc()=0U",
    "__current_sp()=0U",
    "__disable_fiq()=",
    "__disable_irq()=",
    "__enable_fiq()=",
    "__enable_irq()=",
    "__force_stores()=",
    "__memory_changed()=",
    "__schedule_barrier()=",
    "__semihost(x,y)=0",
    "__vfp_status(x,y)=0",
    "__builtin_arm_nop()=",
    "__builtin_arm_wfi()=",
    "__builtin_arm_wfe()=",
    "__builtin_arm_sev()=",
    "__builtin_arm_sevl()=",
    "__builtin_arm_yield()=",
    "__builtin_arm_isb(x)=",
    "__builtin_arm_dsb(x)=",
    "__builtin_arm_dmb(x)=",
    "__builtin_bswap32(x)=0U",
    "__builtin_bswap16(x)=0U",
    "__builtin_arm_rbit(x)=0U",
    "__builtin_clz(x)=0U",
    "__builtin_arm_ldrex(x)=0U",
    "__builtin_arm_strex(x,y)=0U",
    "__builtin_arm_clrex()=",
    "__builtin_arm_ssat(x,y)=0U",
    "__builtin_arm_usat(x,y)=0U",
    "__builtin_arm_ldaex(x)=0U",
    "__builtin_arm_stlex(x,y)=0U",
];

static CPU_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"CPUTYPE\("([^"]+)"\)"#).expect("cpu type pattern"));

static FPU_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bFPU(\d)").expect("fpu pattern"));

/// 目标的 CPU 与 FPU 信息
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CpuInfo {
    pub cpu: Option<String>,
    pub fpu: Option<String>,
}

impl CpuInfo {
    /// 优先解析 `TargetCommonOption.Cpu`（如 `CPUTYPE("Cortex-M4") FPU2`），
    /// 缺失时回退到 `ArmAdsMisc.AdsCpuType` / `RvdsVP`
    pub fn from_target(target: &XmlValue) -> Self {
        let cpu_string = target
            .text_at(&["TargetOption", "TargetCommonOption", "Cpu"])
            .unwrap_or_default();
        let misc = target.at(&["TargetOption", "TargetArmAds", "ArmAdsMisc"]);

        let cpu = CPU_TYPE
            .captures(&cpu_string)
            .map(|caps| caps[1].to_string())
            .or_else(|| {
                misc.and_then(|m| m.text_at(&["AdsCpuType"]))
                    .map(|s| s.trim_matches('"').to_string())
            })
            .filter(|s| !s.is_empty());
        let fpu = FPU_CODE
            .captures(&cpu_string)
            .map(|caps| caps[1].to_string())
            .or_else(|| misc.and_then(|m| m.text_at(&["RvdsVP"])));

        Self { cpu, fpu }
    }
}

/// ARM 工具链（ARMCC / ARMCLANG）
#[derive(Debug, Clone, Copy, Default)]
pub struct ArmFamily;

impl ArmFamily {
    fn cads<'d>(&self, target: &'d XmlValue) -> Option<&'d XmlValue> {
        target.at(&["TargetOption", "TargetArmAds", "Cads"])
    }

    fn cads_number(&self, target: &XmlValue, key: &str) -> Option<i64> {
        self.cads(target)
            .and_then(|c| c.get(key))
            .and_then(XmlValue::as_i64)
    }
}

impl TargetFamily for ArmFamily {
    fn keil_platform(&self) -> Platform {
        Platform::Mdk
    }

    fn check_project(&self, target: &XmlValue) -> Result<(), String> {
        if target.at(&["TargetOption", "TargetArmAds"]).is_none() {
            return Err("missing 'TargetOption.TargetArmAds', this is not an ARM target".to_string());
        }
        Ok(())
    }

    fn get_tool_name(&self, target: &XmlValue) -> ToolName {
        if target.get("uAC6").and_then(XmlValue::as_i64) == Some(1) {
            ToolName::ArmClang
        } else {
            ToolName::ArmCc
        }
    }

    fn get_inc_string(&self, target: &XmlValue) -> String {
        self.cads(target)
            .and_then(|c| c.text_at(&["VariousControls", "IncludePath"]))
            .unwrap_or_default()
    }

    fn get_define_string(&self, target: &XmlValue) -> String {
        self.cads(target)
            .and_then(|c| c.text_at(&["VariousControls", "Define"]))
            .unwrap_or_default()
    }

    fn get_sys_defines(&self, ctx: &FamilyContext<'_>, target: &XmlValue) -> Vec<String> {
        match self.get_tool_name(target) {
            ToolName::ArmClang => {
                let cpu = CpuInfo::from_target(target);
                let flag = cpu.cpu.as_deref().and_then(arm_cpu_flag);
                let compiler = ctx.toolchain.compiler_path(ToolName::ArmClang);
                let mut macros: Vec<String> = ARMCLANG_MACROS.iter().map(|m| m.to_string()).collect();
                macros.extend(ctx.prober.probe(&compiler, flag));
                macros
            }
            _ => ARMCC_MACROS.iter().map(|m| m.to_string()).collect(),
        }
    }

    /// 编译器自带 include 目录及其一级子目录
    fn get_system_includes(&self, ctx: &FamilyContext<'_>, target: &XmlValue) -> Vec<PathBuf> {
        let inc_dir = ctx.toolchain.include_root(self.get_tool_name(target));
        if !inc_dir.is_dir() {
            debug_println!("[DEBUG arm] System include dir missing: {}", inc_dir.display());
            return Vec::new();
        }

        let mut sub_dirs: Vec<PathBuf> = std::fs::read_dir(&inc_dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|entry| entry.path())
                    .filter(|path| path.is_dir())
                    .collect()
            })
            .unwrap_or_default();
        sub_dirs.sort();

        let mut dirs = vec![inc_dir];
        dirs.extend(sub_dirs);
        dirs
    }

    fn get_rte_includes(
        &self,
        ctx: &FamilyContext<'_>,
        target: &XmlValue,
        rte: &XmlValue,
    ) -> PackResolution {
        let cpu = CpuInfo::from_target(target);
        let condition = cpu
            .cpu
            .as_deref()
            .and_then(|c| rots_condition(c, cpu.fpu.as_deref(), self.get_tool_name(target)));
        debug_println!("[DEBUG arm] RTOS condition: {:?}", condition);

        let group_names = as_list(self.get_groups(target))
            .into_iter()
            .filter_map(|g| g.text_at(&["GroupName"]))
            .collect();
        let packs_dir = ctx.toolchain.packs_dir();

        resolve_includes_and_macros(
            PackContext {
                packs_dir: &packs_dir,
                project_dir: ctx.project_dir,
                target_name: ctx.target_name,
                rots_condition: condition,
                group_names,
                normalizer: ctx.normalizer,
            },
            rte,
        )
    }

    fn get_output_folder(&self, target: &XmlValue) -> Option<String> {
        target
            .text_at(&["TargetOption", "TargetCommonOption", "OutputDirectory"])
            .filter(|s| !s.trim().is_empty())
    }

    /// ARMCLANG 输出 GNU 格式的依赖文件，ARMCC 使用自己的格式
    fn parse_ref_lines(&self, target: &XmlValue, lines: &[&str]) -> Vec<String> {
        let dialect = match self.get_tool_name(target) {
            ToolName::ArmClang => DepDialect::Gnu,
            _ => DepDialect::Armcc,
        };
        dialect.parse(lines)
    }

    /// v6Lang: 1 c90, 2 gnu90, 3 c99/c11, 4 gnu99/gnu11, 5 c11, 6 gnu11
    fn get_c_standard(&self, target: &XmlValue) -> String {
        let c99 = self.cads_number(target, "uC99") == Some(1);
        let gnu = self.cads_number(target, "uGnu") == Some(1);
        let std = match self.cads_number(target, "v6Lang") {
            Some(1) => "c90",
            Some(2) => "gnu90",
            Some(3) if c99 => "c99",
            Some(3) => "c11",
            Some(4) if gnu => "gnu99",
            Some(4) => "gnu11",
            Some(5) => "c11",
            Some(6) => "gnu11",
            _ => "c99",
        };
        std.to_string()
    }

    fn get_cpp_standard(&self, target: &XmlValue) -> String {
        let std = match self.cads_number(target, "v6Langp") {
            Some(1) => "c++98",
            Some(2) => "gnu++98",
            Some(3) => "c++11",
            Some(4) => "gnu++11",
            Some(5) => "c++03",
            Some(6) => "c++14",
            Some(7) => "gnu++14",
            Some(8) => "c++17",
            Some(9) => "gnu++17",
            _ => "c++11",
        };
        std.to_string()
    }

    fn get_intellisense_mode(&self, target: &XmlValue) -> String {
        match self.get_tool_name(target) {
            ToolName::ArmClang => "clang-arm",
            _ => "gcc-arm",
        }
        .to_string()
    }
}
