//! 调用 armclang 导出内置宏（`-E -dM`），结果按 编译器+CPU 缓存到进程结束

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::debug_println;
use crate::macros::MacroHandler;
use crate::utils::UniqueList;

/// 调用失败时使用的基础 GNU 版本宏
pub const FALLBACK_MACROS: [&str; 3] = ["__GNUC__=4", "__GNUC_MINOR__=2", "__GNUC_PATCHLEVEL__=1"];

const PROBE_TARGET: &str = "--target=arm-arm-none-eabi";
const POLL_INTERVAL: Duration = Duration::from_millis(20);

type ProbeKey = (PathBuf, Option<String>);

/// 内置宏探测器；缓存由持有者决定生命周期（通常整个进程共享一个）
#[derive(Debug)]
pub struct MacroProber {
    timeout: Duration,
    cache: Mutex<HashMap<ProbeKey, Vec<String>>>,
}

impl MacroProber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// 返回编译器内置宏；任何失败都降级为 [`FALLBACK_MACROS`]，不向上传播
    pub fn probe(&self, compiler: &Path, cpu_flag: Option<&str>) -> Vec<String> {
        let key = (compiler.to_path_buf(), cpu_flag.map(str::to_string));
        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                debug_println!("[DEBUG prober] Cache hit for {}", compiler.display());
                return hit.clone();
            }
        }

        let macros = match self.run(compiler, cpu_flag) {
            Ok(output) => parse_macro_dump(&output),
            Err(reason) => {
                debug_println!(
                    "[DEBUG prober] Probe of {} failed ({}), using fallback macros",
                    compiler.display(),
                    reason
                );
                fallback_macros()
            }
        };

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, macros.clone());
        }
        macros
    }

    /// armclang --target=arm-arm-none-eabi [-mcpu=..] -E -dM -xc - < nul
    fn run(&self, compiler: &Path, cpu_flag: Option<&str>) -> Result<String, String> {
        let mut command = Command::new(compiler);
        command.arg(PROBE_TARGET);
        if let Some(flag) = cpu_flag {
            command.arg(flag);
        }
        command
            .args(["-E", "-dM", "-xc", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = command.spawn().map_err(|e| format!("spawn: {e}"))?;
        let mut stdout = child.stdout.take().ok_or("stdout unavailable")?;
        let reader = thread::spawn(move || {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).map(|_| buf)
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!("timed out after {:?}", self.timeout));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(format!("wait: {e}")),
            }
        };

        let output = reader
            .join()
            .map_err(|_| "reader thread panicked".to_string())?
            .map_err(|e| format!("read: {e}"))?;

        if !status.success() {
            return Err(format!("exit status {status}"));
        }
        Ok(String::from_utf8_lossy(&output).into_owned())
    }
}

impl Default for MacroProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

pub fn fallback_macros() -> Vec<String> {
    FALLBACK_MACROS.iter().map(|s| s.to_string()).collect()
}

/// 解析 `-dM` 输出，保持顺序去重
pub fn parse_macro_dump(output: &str) -> Vec<String> {
    let handler = MacroHandler::new();
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| handler.to_expression(line))
        .collect::<UniqueList>()
        .into_vec()
}

/// uVision 的 CPU 名称到 armclang 参数
pub fn arm_cpu_flag(cpu: &str) -> Option<&'static str> {
    let flag = match cpu.trim().trim_matches('"') {
        "Cortex-M0" => "-mcpu=Cortex-M0",
        "Cortex-M0+" => "-mcpu=cortex-m0plus",
        "Cortex-M1" => "-mcpu=Cortex-M1",
        "Cortex-M3" => "-mcpu=Cortex-M3",
        "Cortex-M4" => "-mcpu=Cortex-M4",
        "Cortex-M7" => "-mcpu=Cortex-M7",
        "Cortex-M23" => "-mcpu=Cortex-M23",
        "Cortex-M33" => "-mcpu=Cortex-M33",
        "Cortex-M35P" => "-mcpu=Cortex-M35P",
        "Cortex-M55" => "-mcpu=Cortex-M55",
        "Cortex-M85" => "-mcpu=Cortex-M85",
        "SC000" => "-mcpu=SC000",
        "SC300" => "-mcpu=SC300",
        "ARMV8MBL" => "-march=armv8-m.base",
        "ARMV8MML" => "-march=armv8-m.main",
        "ARMV81MML" => "-march=armv8.1-m.main",
        "Cortex-A5" => "-mcpu=Cortex-A5",
        "Cortex-A7" => "-mcpu=Cortex-A7",
        "Cortex-A9" => "-mcpu=Cortex-A9",
        _ => return None,
    };
    Some(flag)
}
