use std::env;
use std::path::PathBuf;

use crate::task::TaskKind;

/// 命令行参数结构
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliArgs {
    /// `.uvproj[x]` 文件或工作区目录
    pub input: Option<PathBuf>,
    pub settings: Option<PathBuf>,
    /// 要执行的任务及目标名
    pub task: Option<(TaskKind, String)>,
    pub debug: bool,
    pub show_version: bool,
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {program} [--debug] [--settings <file>] <project.uvproj[x] | workspace_dir> [--build|--rebuild|--download <target>]\n       {program} --version | -v    Show version information"
    )
}

/// 解析命令行参数
pub fn parse_args() -> Result<CliArgs, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    parse_from(&args)
}

/// 解析给定的参数列表（第一个元素是程序名）
pub fn parse_from(args: &[String]) -> Result<CliArgs, Box<dyn std::error::Error>> {
    let program = args.first().map(String::as_str).unwrap_or("uvprj2cpp");
    let mut cli = CliArgs::default();
    let mut iter = args.iter().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--version" | "-v" => cli.show_version = true,
            "--debug" => cli.debug = true,
            "--settings" => {
                let file = iter.next().ok_or_else(|| usage(program))?;
                cli.settings = Some(PathBuf::from(file));
            }
            "--build" | "--rebuild" | "--download" => {
                let kind = match arg.as_str() {
                    "--build" => TaskKind::Build,
                    "--rebuild" => TaskKind::Rebuild,
                    _ => TaskKind::Download,
                };
                let target = iter.next().ok_or_else(|| usage(program))?;
                cli.task = Some((kind, target.clone()));
            }
            flag if flag.starts_with("--") => {
                return Err(format!("Unknown option: {}\n{}", flag, usage(program)).into());
            }
            path => {
                if cli.input.is_some() {
                    return Err(usage(program).into());
                }
                cli.input = Some(PathBuf::from(path));
            }
        }
    }

    if cli.show_version {
        return Ok(cli);
    }

    let Some(input) = &cli.input else {
        return Err(usage(program).into());
    };
    if !input.exists() {
        return Err(format!("File not found: {}", input.display()).into());
    }
    Ok(cli)
}
