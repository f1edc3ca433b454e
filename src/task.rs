//! 通过 Keil `UV4` 命令行执行 Build / Rebuild / Download
//!
//! UV4 不输出到标准输出，只写 `-o` 指定的日志文件；任务运行期间按固定间隔
//! 读取日志新增的部分（GBK 编码），改写其中的相对源文件路径后逐行输出。

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use encoding_rs::{Decoder, GBK};
use regex::Regex;

use crate::debug_println;
use crate::error::KeilError;
use crate::utils::{get_clean_absolute_path, has_drive_prefix, path_to_slash};

const READ_CHUNK: usize = 4096;

/// 编译器诊断行开头的 `file(line)`，只匹配不带盘符的路径
static SOURCE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^\s:()][^:()]*?\.\w+)\((?P<line>\d+)\)").expect("source ref pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Build,
    Rebuild,
    Download,
}

impl TaskKind {
    /// UV4 命令行开关
    pub fn flag(&self) -> &'static str {
        match self {
            TaskKind::Build => "-b",
            TaskKind::Rebuild => "-r",
            TaskKind::Download => "-f",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Build => "Build",
            TaskKind::Rebuild => "Rebuild",
            TaskKind::Download => "Download",
        }
    }
}

/// 启动外部进程并等待结束，返回退出码
pub trait ProcessLauncher: Send + Sync {
    fn run(&self, program: &Path, args: &[String], cwd: &Path) -> io::Result<Option<i32>>;
}

/// 直接启动系统进程
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn run(&self, program: &Path, args: &[String], cwd: &Path) -> io::Result<Option<i32>> {
        debug_println!("[DEBUG task] Running {} {:?}", program.display(), args);
        let status = std::process::Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()?;
        Ok(status.code())
    }
}

/// 任务输出通道
pub trait TaskOutput: Send + Sync {
    fn append_line(&self, line: &str);
}

/// 输出到标准输出
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleOutput;

impl TaskOutput for ConsoleOutput {
    fn append_line(&self, line: &str) {
        println!("{}", line);
    }
}

/// 一次任务调用所需的全部信息
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub kind: TaskKind,
    pub uv4: PathBuf,
    pub project_file: PathBuf,
    pub project_dir: PathBuf,
    pub target_name: String,
    pub log_file: PathBuf,
    pub poll_interval: Duration,
}

impl TaskSpec {
    /// `-b <prj> -j0 -t <target> -o <log>`
    pub fn args(&self) -> Vec<String> {
        vec![
            self.kind.flag().to_string(),
            self.project_file.to_string_lossy().into_owned(),
            "-j0".to_string(),
            "-t".to_string(),
            self.target_name.clone(),
            "-o".to_string(),
            self.log_file.to_string_lossy().into_owned(),
        ]
    }
}

/// 任务线程结束时清除目标的运行标记
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 正在运行的任务
#[derive(Debug)]
pub struct TaskHandle {
    target: String,
    join: JoinHandle<Result<Option<i32>, KeilError>>,
}

impl TaskHandle {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// 等待任务结束，返回 UV4 的退出码
    pub fn wait(self) -> Result<Option<i32>, KeilError> {
        let target = self.target;
        self.join.join().unwrap_or_else(|_| {
            Err(KeilError::io(
                PathBuf::from(&target),
                io::Error::other("task thread panicked"),
            ))
        })
    }
}

/// 启动任务；同一目标已有任务在运行时拒绝（不排队）
pub fn spawn_task(
    running: &Arc<AtomicBool>,
    spec: TaskSpec,
    launcher: Arc<dyn ProcessLauncher>,
    output: Arc<dyn TaskOutput>,
) -> Result<TaskHandle, KeilError> {
    if running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        eprintln!(
            "Warning: A task is already running for target '{}', please wait for it to finish",
            spec.target_name
        );
        return Err(KeilError::TaskRunning {
            target: spec.target_name,
        });
    }
    let guard = RunningGuard(Arc::clone(running));

    truncate_log(&spec.log_file)?;
    output.append_line(&format!(
        "Start to {} target {}",
        spec.kind.label(),
        spec.target_name
    ));

    let target = spec.target_name.clone();
    let join = thread::spawn(move || {
        let _guard = guard;
        run_and_tail(spec, launcher, output)
    });
    Ok(TaskHandle { target, join })
}

fn truncate_log(log_file: &Path) -> Result<(), KeilError> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent).map_err(|e| KeilError::io(parent, e))?;
    }
    std::fs::write(log_file, b"").map_err(|e| KeilError::io(log_file, e))
}

fn run_and_tail(
    spec: TaskSpec,
    launcher: Arc<dyn ProcessLauncher>,
    output: Arc<dyn TaskOutput>,
) -> Result<Option<i32>, KeilError> {
    let mut tail = LogTail::new(&spec.log_file, &spec.project_dir);

    let (tx, rx) = mpsc::channel();
    let program = spec.uv4.clone();
    let args = spec.args();
    let cwd = spec.project_dir.clone();
    thread::spawn(move || {
        let _ = tx.send(launcher.run(&program, &args, &cwd));
    });

    let status = loop {
        match rx.recv_timeout(spec.poll_interval) {
            Ok(result) => break result,
            Err(RecvTimeoutError::Timeout) => {
                for line in tail.poll() {
                    output.append_line(&line);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                break Err(io::Error::other("launcher exited without a status"));
            }
        }
    };

    // 进程结束后读完剩余内容
    for line in tail.finish() {
        output.append_line(&line);
    }
    output.append_line("Build Finished!");

    match status {
        Ok(code) => {
            debug_println!("[DEBUG task] '{}' exited with {:?}", spec.target_name, code);
            Ok(code)
        }
        Err(e) => {
            eprintln!("Warning: Failed to run {}: {}", spec.uv4.display(), e);
            Err(KeilError::io(&spec.uv4, e))
        }
    }
}

/// 增量读取日志文件：游标只增不减，按 GBK 流式解码，只输出完整的行
pub struct LogTail {
    path: PathBuf,
    project_dir: PathBuf,
    cursor: u64,
    decoder: Decoder,
    pending: String,
}

impl LogTail {
    pub fn new(path: &Path, project_dir: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            project_dir: project_dir.to_path_buf(),
            cursor: 0,
            decoder: GBK.new_decoder(),
            pending: String::new(),
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// 读取新增内容，返回其中已完整的行
    pub fn poll(&mut self) -> Vec<String> {
        let bytes = self.read_new();
        if !bytes.is_empty() {
            self.decode(&bytes, false);
        }
        self.take_lines()
    }

    /// 最后一次读取，未以换行结尾的内容也作为一行输出
    pub fn finish(mut self) -> Vec<String> {
        let bytes = self.read_new();
        self.decode(&bytes, true);
        let mut lines = self.take_lines();
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            lines.push(self.rewrite(rest.trim_end_matches('\r')));
        }
        lines
    }

    fn read_new(&mut self) -> Vec<u8> {
        let mut bytes = Vec::new();
        let Ok(mut file) = File::open(&self.path) else {
            return bytes;
        };
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len < self.cursor {
            debug_println!("[DEBUG task] Log {} shrank, restart from 0", self.path.display());
            self.cursor = 0;
            self.decoder = GBK.new_decoder();
            self.pending.clear();
        }
        if len == self.cursor || file.seek(SeekFrom::Start(self.cursor)).is_err() {
            return bytes;
        }

        let mut buf = [0u8; READ_CHUNK];
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    bytes.extend_from_slice(&buf[..n]);
                    self.cursor += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        bytes
    }

    fn decode(&mut self, bytes: &[u8], last: bool) {
        let needed = self
            .decoder
            .max_utf8_buffer_length(bytes.len())
            .unwrap_or(bytes.len() * 3 + 16);
        self.pending.reserve(needed);
        let _ = self.decoder.decode_to_string(bytes, &mut self.pending, last);
    }

    fn take_lines(&mut self) -> Vec<String> {
        let Some(end) = self.pending.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(end + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete
            .lines()
            .map(|line| self.rewrite(line.trim_end_matches('\r')))
            .collect()
    }

    fn rewrite(&self, line: &str) -> String {
        rewrite_source_refs(line, &self.project_dir)
    }
}

/// 诊断行开头的相对 `file(line)` 改写为工程目录下的绝对路径
pub fn rewrite_source_refs(line: &str, project_dir: &Path) -> String {
    let Some(caps) = SOURCE_REF.captures(line) else {
        return line.to_string();
    };
    let file = &caps["file"];
    if has_drive_prefix(file) || file.starts_with('/') {
        return line.to_string();
    }

    let absolute = path_to_slash(&get_clean_absolute_path(project_dir, file));
    let matched = caps.get(0).map(|m| m.end()).unwrap_or(0);
    format!("{}({}){}", absolute, &caps["line"], &line[matched..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_relative_reference() {
        let line = r"..\src\main.c(12): error:  #20: identifier x is undefined";
        assert_eq!(
            rewrite_source_refs(line, Path::new("/ws/prj")),
            "/ws/src/main.c(12): error:  #20: identifier x is undefined"
        );
        assert_eq!(
            rewrite_source_refs("compiling main.c...", Path::new("/ws/prj")),
            "compiling main.c..."
        );
        let absolute = r"C:\work\main.c(3): warning: unused";
        assert_eq!(rewrite_source_refs(absolute, Path::new("/ws/prj")), absolute);
    }

    #[test]
    fn test_log_tail_incremental_gbk() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("t_uv4.log");
        let (encoded, _, _) = GBK.encode("编译完成\n第二行");
        std::fs::write(&log, b"").unwrap();

        let mut tail = LogTail::new(&log, dir.path());
        assert!(tail.poll().is_empty());

        // 在多字节字符中间截断
        std::fs::write(&log, &encoded[..3]).unwrap();
        assert!(tail.poll().is_empty());
        std::fs::write(&log, &encoded[..]).unwrap();
        assert_eq!(tail.poll(), vec!["编译完成"]);
        assert_eq!(tail.cursor(), encoded.len() as u64);

        assert_eq!(tail.finish(), vec!["第二行"]);
    }

    #[test]
    fn test_log_tail_restarts_after_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("t_uv4.log");
        let (old, _, _) = GBK.encode("上一次的输出\n残留");
        std::fs::write(&log, &old[..old.len() - 1]).unwrap();

        let mut tail = LogTail::new(&log, dir.path());
        assert_eq!(tail.poll(), vec!["上一次的输出"]);

        // 新任务截断日志后重新写入
        std::fs::write(&log, b"Done\n").unwrap();
        assert_eq!(tail.poll(), vec!["Done"]);
        assert!(tail.finish().is_empty());
    }

    #[test]
    fn test_task_args() {
        let spec = TaskSpec {
            kind: TaskKind::Download,
            uv4: PathBuf::from("UV4"),
            project_file: PathBuf::from("/ws/a.uvprojx"),
            project_dir: PathBuf::from("/ws"),
            target_name: "Debug".into(),
            log_file: PathBuf::from("/ws/.vscode/Debug_uv4.log"),
            poll_interval: Duration::from_millis(10),
        };
        assert_eq!(
            spec.args(),
            vec!["-f", "/ws/a.uvprojx", "-j0", "-t", "Debug", "-o", "/ws/.vscode/Debug_uv4.log"]
        );
    }
}
