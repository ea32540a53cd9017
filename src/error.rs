use std::io;

/// Errors raised while dispatching or executing a pipeline.
///
/// Every variant renders as `<command>: <message>` so the REPL only has to
/// prepend the shell name.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A pipe or process-creation primitive failed.
    #[error("{call}: {source}")]
    Spawn {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{command}: argument contains a NUL byte")]
    InvalidArgument { command: String },

    #[error("{command}: {path}: {source}")]
    Redirect {
        command: String,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("cd: {path}: {source}")]
    Chdir {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("cd: HOME not set")]
    HomeUnset,

    #[error("cd: cannot be part of a pipeline")]
    CdInPipeline,

    /// A `|` with no command on one side of it.
    #[error("syntax error: missing command next to `|`")]
    EmptyStage,
}

impl ShellError {
    /// Exit status reported for a stage that failed with this error.
    pub fn exit_status(&self) -> i32 {
        match self {
            Self::UnknownCommand(_) => 127,
            Self::InvalidArgument { .. } => 126,
            Self::EmptyStage => 2,
            _ => 1,
        }
    }

    pub fn spawn(call: &'static str) -> Self {
        Self::Spawn {
            call,
            source: io::Error::last_os_error(),
        }
    }
}
