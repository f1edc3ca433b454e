use std::path::PathBuf;
use std::sync::Arc;

use uvprj2cpp::{
    ConsoleOutput, KeilSettings, SystemLauncher, Workspace, compute_absolute_path, debug_println,
    find_projects, parse_args, set_debug_mode,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args()?;
    set_debug_mode(args.debug);

    if args.show_version {
        println!("uvprj2cpp v{}", VERSION);
        return Ok(());
    }

    let input = compute_absolute_path(args.input.as_deref().ok_or("missing project path")?)?;

    // 传入工程文件时以其所在目录为工作区
    let (workspace_dir, explicit_file) = if input.is_file() {
        let dir = input
            .parent()
            .map(PathBuf::from)
            .ok_or("project file has no parent directory")?;
        (dir, Some(input.clone()))
    } else {
        (input.clone(), None)
    };
    debug_println!("[DEBUG] Workspace Root: {}", workspace_dir.display());

    let settings = match &args.settings {
        Some(file) => KeilSettings::from_file(file)?,
        None => KeilSettings::discover(&workspace_dir)?,
    };

    let files = match explicit_file {
        Some(file) => vec![file],
        None => find_projects(&workspace_dir, &settings),
    };
    if files.is_empty() {
        return Err(format!("No uVision project found in {}", workspace_dir.display()).into());
    }

    let workspace = Workspace::open_files(&workspace_dir, settings, &files);
    if workspace.projects().is_empty() {
        return Err("No project could be loaded".into());
    }

    for project in workspace.projects() {
        for target in project.targets() {
            println!(
                "Loaded {} [{}]: {} include paths, {} defines",
                project.label(),
                target.config_name(),
                target.includes().len(),
                target.defines().len()
            );
        }
    }
    println!(
        "Generated {}",
        workspace_dir.join(".vscode").join("c_cpp_properties.json").display()
    );

    if let Some((kind, target)) = &args.task {
        let project = workspace
            .find_target_project(target)
            .ok_or_else(|| format!("Target '{}' not found", target))?;
        let handle = project.run_task(
            *kind,
            target,
            Arc::new(SystemLauncher),
            Arc::new(ConsoleOutput),
        )?;
        // UV4 的退出码不作判断，结果以日志输出为准
        match handle.wait()? {
            Some(code) => println!("UV4 {} exited with code {}", kind.label(), code),
            None => println!("UV4 {} terminated without exit code", kind.label()),
        }
    }

    workspace.close();
    Ok(())
}
