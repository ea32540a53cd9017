use std::{
    fs::{self, create_dir_all},
    path::{Path, PathBuf},
};

use directories::BaseDirs;
use tracing::{debug, warn};

use crate::{builtins::Flow, shell::Shell};

pub const DEFAULT_NAME: &str = "pipesh";

const DEFAULT_CONFIG: &str = "\
# prompt = \"pipesh> \"
# name = \"pipesh\"
#startup
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Replaces the `user@host:cwd name$ ` prompt when set.
    pub prompt: Option<String>,
    /// Shell name used as the diagnostic prefix.
    pub name: String,
    /// Lines run through the shell before the first prompt.
    pub startup: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prompt: None,
            name: DEFAULT_NAME.to_string(),
            startup: vec![],
        }
    }
}

//config file
pub fn config_file_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.config_dir().join("pipesh/pipesh.conf"))
}

//history file
pub fn history_file_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.data_dir().join("pipesh/history"))
}

/// Loads the config file, writing a commented default first if none exists.
pub fn init() -> Config {
    let Some(config_path) = config_file_path() else {
        warn!("no home directory, using default configuration");
        return Config::default();
    };

    if !config_path.exists() {
        let created = config_path
            .parent()
            .map_or(Ok(()), create_dir_all)
            .and_then(|()| fs::write(&config_path, DEFAULT_CONFIG));
        if let Err(e) = created {
            warn!(path = %config_path.display(), "could not create config file: {e}");
        }
    }
    load_config(&config_path)
}

pub fn load_config(path: &Path) -> Config {
    match fs::read_to_string(path) {
        Ok(content) => parse_config(&content),
        Err(e) => {
            debug!(path = %path.display(), "using default configuration: {e}");
            Config::default()
        }
    }
}

fn parse_config(content: &str) -> Config {
    let mut config = Config::default();
    let mut in_startup = false;

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(comment) = line.strip_prefix('#') {
            if comment.trim().eq_ignore_ascii_case("startup") {
                in_startup = true;
            }
            continue;
        }

        if in_startup {
            config.startup.push(line.to_string());
        } else if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "prompt" => config.prompt = Some(value),
                "name" if !value.is_empty() => config.name = value,
                other => warn!("unknown config key `{other}`"),
            }
        }
    }
    config
}

/// Runs the startup lines in order; stops early if one of them exits.
pub fn run_startup(config: &Config, shell: &mut Shell) -> Flow {
    for cmd_line in &config.startup {
        if let Flow::Exit = shell.exec_reported(cmd_line) {
            return Flow::Exit;
        }
    }
    Flow::Continue(0)
}
