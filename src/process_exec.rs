use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    os::unix::ffi::OsStringExt,
};

use libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO, pid_t};
use tracing::{debug, warn};

use crate::{
    error::ShellError,
    parse::{Argv, Command, Pipeline},
    shell::Context,
};

const STATUS_NOT_EXECUTABLE: i32 = 126;

/// A pipeline left running in the background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub leader: pid_t,
    pub name: String,
    pending: Vec<pid_t>,
}

/// Spawns pipelines as chains of processes and tracks background jobs.
#[derive(Debug, Default)]
pub struct PipelineExecutor {
    jobs: Vec<Job>,
}

// Per-stage outcome of the spawn loop
#[derive(Debug, Clone, Copy)]
enum StageState {
    Running(pid_t),
    Failed(i32),
}

/// Everything a stage needs after `fork`, prepared up front so the child
/// only has to issue system calls.
struct Stage {
    path: CString,
    argv: Argv,
    stdin: Option<File>,
    stdout: Option<File>,
    exec_failure: CString,
}

impl PipelineExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Spawns one process per stage, wiring stage `i`'s stdout to stage
    /// `i + 1`'s stdin, and returns the status of the last stage.
    ///
    /// Background pipelines return 0 right after spawning. A stage that cannot
    /// be resolved or opened is reported and skipped; its neighbours see a
    /// closed pipe. Failing to create a pipe or fork aborts the whole pipeline.
    ///
    /// Background stages share a process group of their own, and the first
    /// one reads from `/dev/null` unless it has an input redirect.
    pub fn run(&mut self, pipeline: &Pipeline, ctx: &Context) -> Result<i32, ShellError> {
        let stages: Vec<&Command> = pipeline.stages().collect();
        if stages.iter().any(|command| command.name.is_empty()) {
            return Err(ShellError::EmptyStage);
        }

        let last = stages.len() - 1;
        let background = pipeline.background();
        let mut states = Vec::with_capacity(stages.len());
        let mut prev_read: Option<OwnedFd> = None;
        // Process group of a background pipeline, once its first stage runs
        let mut group: Option<pid_t> = None;

        for (i, command) in stages.iter().enumerate() {
            // The stage's output pipe exists before the stage is spawned
            let pipe = if i < last {
                match pipe() {
                    Ok(pipe) => Some(pipe),
                    Err(source) => {
                        drop(prev_read.take());
                        abandon(&states);
                        return Err(ShellError::Spawn { call: "pipe", source });
                    }
                }
            } else {
                None
            };

            let prepared = Stage::prepare(command, ctx).and_then(|mut stage| {
                if background && i == 0 {
                    stage.detach_stdin(command)?;
                }
                Ok(stage)
            });

            let state = match prepared {
                Ok(stage) => {
                    let (pipe_read, pipe_write) = match &pipe {
                        Some((read, write)) => (Some(read), Some(write)),
                        None => (None, None),
                    };
                    let pgid = background.then(|| group.unwrap_or(0));
                    match stage.spawn(prev_read.as_ref(), pipe_write, pipe_read, pgid) {
                        Ok(pid) => {
                            debug!(pid, stage = i, name = %command.name, "spawned stage");
                            if background && group.is_none() {
                                group = Some(pid);
                            }
                            StageState::Running(pid)
                        }
                        Err(e) => {
                            drop(prev_read.take());
                            drop(pipe);
                            abandon(&states);
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    eprintln!("{}: {e}", ctx.name);
                    StageState::Failed(e.exit_status())
                }
            };
            states.push(state);

            // Only the next stage needs this read end; the write end now
            // belongs to the child alone.
            prev_read = pipe.map(|(read, _write)| read);
        }

        if background {
            self.push_job(pipeline, &states);
            return Ok(0);
        }

        let mut status = 0;
        for state in states {
            status = match state {
                StageState::Running(pid) => wait_for(pid).unwrap_or_else(|e| {
                    warn!(pid, "waitpid failed: {e}");
                    1
                }),
                StageState::Failed(code) => code,
            };
        }
        debug!(status, "pipeline finished");
        Ok(status)
    }

    fn push_job(&mut self, pipeline: &Pipeline, states: &[StageState]) {
        let pending: Vec<pid_t> = states
            .iter()
            .filter_map(|state| match state {
                StageState::Running(pid) => Some(*pid),
                StageState::Failed(_) => None,
            })
            .collect();

        let Some(&leader) = pending.first() else {
            return;
        };
        let name = pipeline.root().name.clone();
        println!("[{leader}] Background process started: {name}");
        self.jobs.push(Job {
            leader,
            name,
            pending,
        });
    }

    /// Collects exited background processes without blocking and returns
    /// the jobs whose stages have all finished.
    pub fn reap_background(&mut self) -> Vec<Job> {
        let (done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.jobs)
            .into_iter()
            .map(|mut job| {
                job.pending.retain(|&pid| !try_reap(pid));
                job
            })
            .partition(|job| job.pending.is_empty());

        self.jobs = running;
        for job in &done {
            debug!(leader = job.leader, name = %job.name, "background job finished");
        }
        done
    }
}

impl Stage {
    fn prepare(command: &Command, ctx: &Context) -> Result<Self, ShellError> {
        let path = ctx
            .paths
            .resolve(&command.name)
            .ok_or_else(|| ShellError::UnknownCommand(command.name.clone()))?;

        let nul = |_| ShellError::InvalidArgument {
            command: command.name.clone(),
        };
        let path = CString::new(path.into_os_string().into_vec()).map_err(nul)?;
        let argv = command.argv().map_err(nul)?;
        let exec_failure =
            CString::new(format!("{}: {}: cannot execute\n", ctx.name, command.name)).map_err(nul)?;

        let redirects = &command.redirects;
        let stdin = redirects
            .stdin
            .as_deref()
            .map(|target| open_redirect(command, target, OpenOptions::new().read(true)))
            .transpose()?;
        let truncate = redirects
            .truncate
            .as_deref()
            .map(|target| {
                open_redirect(
                    command,
                    target,
                    OpenOptions::new().write(true).create(true).truncate(true),
                )
            })
            .transpose()?;
        let append = redirects
            .append
            .as_deref()
            .map(|target| open_redirect(command, target, OpenOptions::new().append(true).create(true)))
            .transpose()?;

        Ok(Self {
            path,
            argv,
            stdin,
            // When both are given the append target wins
            stdout: append.or(truncate),
            exec_failure,
        })
    }

    // Keeps a background stage off the terminal
    fn detach_stdin(&mut self, command: &Command) -> Result<(), ShellError> {
        if self.stdin.is_none() {
            self.stdin = Some(open_redirect(command, "/dev/null", OpenOptions::new().read(true))?);
        }
        Ok(())
    }

    /// Forks and execs the stage. Explicit redirects take precedence over
    /// the pipe ends passed in. With `pgid` set the child joins that process
    /// group, or leads a new one when it is 0.
    fn spawn(
        self,
        prev_read: Option<&OwnedFd>,
        pipe_write: Option<&OwnedFd>,
        pipe_read: Option<&OwnedFd>,
        pgid: Option<pid_t>,
    ) -> Result<pid_t, ShellError> {
        let stdin = self
            .stdin
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .or(prev_read.map(AsRawFd::as_raw_fd));
        let stdout = self
            .stdout
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .or(pipe_write.map(AsRawFd::as_raw_fd));

        // Every descriptor the child must drop once stdin/stdout are in place
        let close: Vec<RawFd> = [prev_read, pipe_write, pipe_read]
            .into_iter()
            .flatten()
            .map(AsRawFd::as_raw_fd)
            .chain(self.stdin.iter().map(AsRawFd::as_raw_fd))
            .chain(self.stdout.iter().map(AsRawFd::as_raw_fd))
            .collect();

        match unsafe { libc::fork() } {
            -1 => Err(ShellError::spawn("fork")),
            0 => unsafe { self.exec_child(stdin, stdout, &close, pgid) },
            pid => {
                // Set from both sides so the group exists whichever runs first
                if let Some(pgid) = pgid {
                    unsafe { libc::setpgid(pid, if pgid == 0 { pid } else { pgid }) };
                }
                Ok(pid)
            }
        }
    }

    /// Runs in the forked child. Must not allocate.
    unsafe fn exec_child(
        &self,
        stdin: Option<RawFd>,
        stdout: Option<RawFd>,
        close: &[RawFd],
        pgid: Option<pid_t>,
    ) -> ! {
        unsafe {
            if let Some(pgid) = pgid {
                libc::setpgid(0, pgid);
            }
            libc::signal(libc::SIGINT, libc::SIG_DFL);
            libc::signal(libc::SIGQUIT, libc::SIG_DFL);
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);

            let wired = stdin.is_none_or(|fd| libc::dup2(fd, STDIN_FILENO) != -1)
                && stdout.is_none_or(|fd| libc::dup2(fd, STDOUT_FILENO) != -1);

            for &fd in close {
                if fd > STDERR_FILENO {
                    libc::close(fd);
                }
            }

            if wired {
                libc::execv(self.path.as_ptr(), self.argv.as_ptr());
            }

            let msg = self.exec_failure.as_bytes();
            libc::write(STDERR_FILENO, msg.as_ptr().cast(), msg.len());
            libc::_exit(STATUS_NOT_EXECUTABLE)
        }
    }
}

fn open_redirect(command: &Command, target: &str, options: &OpenOptions) -> Result<File, ShellError> {
    options.open(target).map_err(|source| ShellError::Redirect {
        command: command.name.clone(),
        path: target.to_string(),
        source,
    })
}

/// Creates a pipe whose ends are closed on exec, so they never leak into
/// unrelated children.
fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [0; 2];

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };

    if rc == -1 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: both descriptors were just created and are owned by nobody else
    let ends = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    for fd in [&ends.0, &ends.1] {
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(ends)
}

// Waits out stages spawned before a setup failure
fn abandon(states: &[StageState]) {
    for state in states {
        if let StageState::Running(pid) = *state {
            let _ = wait_for(pid);
        }
    }
}

fn wait_for(pid: pid_t) -> io::Result<i32> {
    let mut status = 0;
    loop {
        if unsafe { libc::waitpid(pid, &mut status, 0) } != -1 {
            return Ok(decode_status(status));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

// true once `pid` is gone
fn try_reap(pid: pid_t) -> bool {
    let mut status = 0;
    match unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) } {
        0 => false,
        -1 => io::Error::last_os_error().kind() != io::ErrorKind::Interrupted,
        _ => true,
    }
}

fn decode_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse::parse, path::PathTable};
    use std::{fs, sync::Arc, thread, time::Duration};

    fn ctx() -> Context {
        Context {
            name: "pipesh".into(),
            paths: Arc::new(PathTable::from_env()),
        }
    }

    fn run(line: &str) -> Result<i32, ShellError> {
        PipelineExecutor::new().run(&parse(line), &ctx())
    }

    #[test]
    fn three_stages_chain_through_two_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let line = format!("echo hello world | tr a-z A-Z | tr -d O > {}", out.display());

        assert_eq!(run(&line).unwrap(), 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "HELL WRLD\n");
    }

    #[test]
    fn stdin_and_stdout_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let out = dir.path().join("out.txt");
        fs::write(&input, "b\na\nc\n").unwrap();
        fs::write(&out, "stale contents that must disappear\n").unwrap();

        let line = format!("sort < {} > {}", input.display(), out.display());
        assert_eq!(run(&line).unwrap(), 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "a\nb\nc\n");
    }

    #[test]
    fn append_redirect_keeps_existing_contents() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.txt");
        fs::write(&log, "first\n").unwrap();

        let line = format!("echo second >>{}", log.display());
        assert_eq!(run(&line).unwrap(), 0);
        assert_eq!(fs::read_to_string(&log).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn redirect_overrides_pipe_output() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.txt");
        let second = dir.path().join("second.txt");

        let line = format!(
            "echo hi > {} | cat > {}",
            first.display(),
            second.display()
        );
        assert_eq!(run(&line).unwrap(), 0);
        assert_eq!(fs::read_to_string(&first).unwrap(), "hi\n");
        assert_eq!(fs::read_to_string(&second).unwrap(), "");
    }

    #[test]
    fn exit_status_of_last_stage_is_returned() {
        assert_eq!(run("true").unwrap(), 0);
        assert_eq!(run("false").unwrap(), 1);
        assert_eq!(run("false | true").unwrap(), 0);
        assert_eq!(run("true | false").unwrap(), 1);
    }

    #[test]
    fn unknown_command_reports_127() {
        assert_eq!(run("pipesh-no-such-command-xyz").unwrap(), 127);
        assert_eq!(run("true | pipesh-no-such-command-xyz").unwrap(), 127);
    }

    #[test]
    fn unknown_middle_stage_does_not_hang_neighbours() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let line = format!(
            "yes | pipesh-no-such-command-xyz | cat > {}",
            out.display()
        );

        assert_eq!(run(&line).unwrap(), 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "");
    }

    #[test]
    fn missing_input_file_fails_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let line = format!("cat < {}", dir.path().join("missing").display());
        assert_eq!(run(&line).unwrap(), 1);
    }

    #[test]
    fn background_pipeline_returns_immediately_and_is_reaped() {
        let mut executor = PipelineExecutor::new();
        let status = executor.run(&parse("sleep 0 | true &"), &ctx()).unwrap();
        assert_eq!(status, 0);
        assert_eq!(executor.jobs().len(), 1);
        assert_eq!(executor.jobs()[0].name, "sleep");

        let finished = wait_until_reaped(&mut executor);
        assert!(executor.jobs().is_empty());
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].name, "sleep");
    }

    fn wait_until_reaped(executor: &mut PipelineExecutor) -> Vec<Job> {
        let mut finished = Vec::new();
        for _ in 0..100 {
            finished.extend(executor.reap_background());
            if executor.jobs().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        finished
    }

    #[test]
    fn background_job_leads_its_own_process_group() {
        let mut executor = PipelineExecutor::new();
        executor.run(&parse("sleep 5 | sleep 5 &"), &ctx()).unwrap();
        let job = executor.jobs()[0].clone();

        let shell_group = unsafe { libc::getpgid(0) };
        let job_group = unsafe { libc::getpgid(job.leader) };
        let pending_groups: Vec<pid_t> = job
            .pending
            .iter()
            .map(|&pid| unsafe { libc::getpgid(pid) })
            .collect();

        for &pid in &job.pending {
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
        wait_until_reaped(&mut executor);

        assert_ne!(job_group, shell_group);
        assert_eq!(job_group, job.leader);
        assert!(pending_groups.iter().all(|&group| group == job.leader));
    }

    #[test]
    fn background_first_stage_reads_dev_null() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let mut executor = PipelineExecutor::new();

        let line = format!("cat > {} &", out.display());
        executor.run(&parse(&line), &ctx()).unwrap();

        assert_eq!(wait_until_reaped(&mut executor).len(), 1);
        assert_eq!(fs::read_to_string(&out).unwrap(), "");
    }

    #[test]
    fn background_input_redirect_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let out = dir.path().join("out.txt");
        fs::write(&input, "kept\n").unwrap();
        let mut executor = PipelineExecutor::new();

        let line = format!("cat < {} > {} &", input.display(), out.display());
        executor.run(&parse(&line), &ctx()).unwrap();

        assert_eq!(wait_until_reaped(&mut executor).len(), 1);
        assert_eq!(fs::read_to_string(&out).unwrap(), "kept\n");
    }

    #[test]
    fn failed_exec_reports_126() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("notexec");
        fs::write(&plain, "not a program\n").unwrap();

        assert_eq!(run(&plain.display().to_string()).unwrap(), 126);
    }

    #[test]
    fn empty_stage_is_rejected_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");

        let err = run(&format!("touch {} | | cat", marker.display())).unwrap_err();
        assert!(matches!(err, ShellError::EmptyStage));
        assert!(!marker.exists());

        assert!(matches!(run("echo hi |"), Err(ShellError::EmptyStage)));
    }

    #[test]
    fn signal_termination_maps_above_128() {
        assert_eq!(decode_status(libc::SIGKILL), 128 + 9);
    }
}
