use std::fs;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
    pub home: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_cap") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "cap.exe" } else { "cap" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve cap binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    run_cli_case_with_env(case_name, args, &[])
}

/// Runs the binary with an isolated HOME and persistence disabled, so a
/// case can never read or write the developer's real config or data.
pub fn run_cli_case_with_env(
    case_name: &str,
    args: &[&str],
    extra_env: &[(&str, &str)],
) -> CmdResult {
    let root = std::env::temp_dir().join("cap-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let case_id = format!("{}-{}", sanitize(case_name), now_millis());
    let log_path = root.join(format!("{case_id}.log"));
    let home = std::env::temp_dir().join("cap-test-homes").join(&case_id);
    fs::create_dir_all(&home).expect("create temp test home");

    let bin_path = resolve_bin_path();

    let mut command = Command::new(&bin_path);
    command
        .args(args)
        .env("HOME", &home)
        .env("CAP_EPHEMERAL", "1")
        .env("RUST_BACKTRACE", "1")
        .env_remove("CAP_OUTPUT_FORMAT");
    for (key, value) in extra_env {
        command.env(key, value);
    }
    let output = command.output().expect("execute cap command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("home={}\n", home.display()));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
        home,
    }
}
