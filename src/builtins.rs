use std::{env, path::PathBuf};

use tracing::debug;

use crate::{error::ShellError, parse::Pipeline};

/// Command names handled by the shell itself.
pub const BUILTINS: &[&str] = &["cd", "exit"];

/// What the REPL should do after a line has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep prompting; carries the exit status of the line.
    Continue(i32),
    Exit,
}

/// Runs the pipeline in-process when its first stage is a builtin.
///
/// Returns `None` when the pipeline has to be spawned instead. Any stages
/// after a blank or `exit` stage are discarded.
pub fn dispatch(pipeline: &Pipeline) -> Option<Result<Flow, ShellError>> {
    if pipeline.is_noop() {
        return Some(Ok(Flow::Continue(0)));
    }

    let flow = match pipeline.root().name.as_str() {
        "exit" => Ok(Flow::Exit),
        "cd" => cd(pipeline, home_dir).map(|()| Flow::Continue(0)),
        _ => return None,
    };
    Some(flow)
}

/// Change current working directory; `home` is consulted only without an argument
fn cd(pipeline: &Pipeline, home: impl FnOnce() -> Result<PathBuf, ShellError>) -> Result<(), ShellError> {
    if pipeline.len() > 1 {
        return Err(ShellError::CdInPipeline);
    }

    let target = match pipeline.root().args.get(1) {
        Some(dir) => PathBuf::from(dir),
        None => home()?,
    };

    debug!(target = %target.display(), "changing directory");
    env::set_current_dir(&target).map_err(|source| ShellError::Chdir {
        path: target.display().to_string(),
        source,
    })
}

fn home_dir() -> Result<PathBuf, ShellError> {
    env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .ok_or(ShellError::HomeUnset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;
    use std::sync::Mutex;

    // The working directory is process-wide; tests that move it take turns.
    // Every other test in the crate sticks to absolute paths.
    static CWD: Mutex<()> = Mutex::new(());

    // Runs `f`, then puts the working directory back and returns where it ended up
    fn in_scratch_cwd<T>(f: impl FnOnce() -> T) -> (T, PathBuf) {
        let _guard = CWD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let original = env::current_dir().unwrap();
        let result = f();
        let now = env::current_dir().unwrap();
        env::set_current_dir(&original).unwrap();
        (result, now)
    }

    #[test]
    fn blank_line_is_handled_as_success() {
        let flow = dispatch(&parse("   ")).unwrap().unwrap();
        assert_eq!(flow, Flow::Continue(0));
    }

    #[test]
    fn exit_ignores_following_stages() {
        let flow = dispatch(&parse("exit | definitely-not-a-command")).unwrap().unwrap();
        assert_eq!(flow, Flow::Exit);
    }

    #[test]
    fn external_commands_fall_through() {
        assert!(dispatch(&parse("ls -la")).is_none());
        assert!(dispatch(&parse("cat x | cd")).is_none());
    }

    #[test]
    fn cd_in_pipeline_is_rejected() {
        let err = dispatch(&parse("cd /tmp | cat")).unwrap().unwrap_err();
        assert!(matches!(err, ShellError::CdInPipeline));
    }

    #[test]
    fn cd_to_missing_directory_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let line = format!("cd {}", missing.display());

        let err = dispatch(&parse(&line)).unwrap().unwrap_err();
        match err {
            ShellError::Chdir { path, .. } => assert_eq!(path, missing.display().to_string()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cd_changes_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let line = format!("cd {}", dir.path().display());

        let (flow, now) = in_scratch_cwd(|| dispatch(&parse(&line)).unwrap().unwrap());

        assert_eq!(flow, Flow::Continue(0));
        assert_eq!(now.canonicalize().unwrap(), dir.path().canonicalize().unwrap());
    }

    #[test]
    fn cd_without_argument_goes_home() {
        let home = tempfile::tempdir().unwrap();
        let home_path = home.path().to_path_buf();

        let (result, now) = in_scratch_cwd(|| cd(&parse("cd"), || Ok(home_path)));

        result.unwrap();
        assert_eq!(now.canonicalize().unwrap(), home.path().canonicalize().unwrap());
    }

    #[test]
    fn cd_with_argument_ignores_home() {
        let dir = tempfile::tempdir().unwrap();
        let line = format!("cd {}", dir.path().display());

        let (result, now) = in_scratch_cwd(|| cd(&parse(&line), || Err(ShellError::HomeUnset)));

        result.unwrap();
        assert_eq!(now.canonicalize().unwrap(), dir.path().canonicalize().unwrap());
    }

    #[test]
    fn cd_without_home_reports_it() {
        let (result, _) = in_scratch_cwd(|| cd(&parse("cd"), || Err(ShellError::HomeUnset)));
        assert!(matches!(result, Err(ShellError::HomeUnset)));
    }
}
