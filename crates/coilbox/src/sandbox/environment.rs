use std::collections::BTreeMap;

/// Default argv[0] for the guest interpreter
pub const DEFAULT_PROGRAM_NAME: &str = "python";

/// Guest path program bytes are written to when no main path is given
pub const DEFAULT_MAIN_FILE: &str = "main.py";

/// How the guest interpreter is started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    /// Run the script at this guest path
    RunFile(String),
    /// No script; the interpreter reads from standard input
    Interactive,
}

impl LaunchMode {
    /// Program bytes or an explicit main path select run-file mode.
    /// Program bytes without a path run [`DEFAULT_MAIN_FILE`].
    pub fn select(has_program: bool, main_path: Option<&str>) -> Self {
        match main_path {
            Some(path) => LaunchMode::RunFile(path.to_string()),
            None if has_program => LaunchMode::RunFile(DEFAULT_MAIN_FILE.to_string()),
            None => LaunchMode::Interactive,
        }
    }

    /// Guest argv for this mode
    pub fn argv(&self, program_name: &str) -> Vec<String> {
        match self {
            LaunchMode::RunFile(path) => vec![program_name.to_string(), path.clone()],
            LaunchMode::Interactive => vec![program_name.to_string()],
        }
    }

    pub fn main_path(&self) -> Option<&str> {
        match self {
            LaunchMode::RunFile(path) => Some(path),
            LaunchMode::Interactive => None,
        }
    }
}

/// Guest environment: caller values plus interpreter defaults for any key
/// the caller left unset.
pub fn guest_env(
    user: &BTreeMap<String, String>,
    bytecode_cache_dir: Option<&str>,
) -> BTreeMap<String, String> {
    let mut env = user.clone();
    let mut fill = |key: &str, value: &str| {
        env.entry(key.to_string())
            .or_insert_with(|| value.to_string());
    };

    fill("PYTHONHOME", "/");
    fill("PYTHONPATH", "/");
    fill("PYTHONUNBUFFERED", "1");
    match bytecode_cache_dir {
        Some(dir) => fill("PYTHONPYCACHEPREFIX", dir),
        None => fill("PYTHONDONTWRITEBYTECODE", "1"),
    }
    env
}
