use std::sync::Arc;

use tracing::debug;

use crate::{
    builtins::{self, Flow},
    completions,
    error::ShellError,
    parse::{Pipeline, parse},
    path::PathTable,
    process_exec::PipelineExecutor,
};

/// Process-wide state fixed at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct Context {
    /// Prefix of every diagnostic.
    pub name: String,
    pub paths: Arc<PathTable>,
}

pub struct Shell {
    ctx: Context,
    executor: PipelineExecutor,
}

impl Shell {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            executor: PipelineExecutor::new(),
        }
    }

    // Main execution entry point
    pub fn exec(&mut self, line: &str) -> Result<Flow, ShellError> {
        let pipeline = parse(line);
        self.run(&pipeline)
    }

    pub fn run(&mut self, pipeline: &Pipeline) -> Result<Flow, ShellError> {
        // A trailing `?` asks for candidates instead of running anything
        if pipeline.autocomplete() {
            completions::print_candidates(&self.ctx.paths, &pipeline.root().name);
            return Ok(Flow::Continue(0));
        }

        if let Some(flow) = builtins::dispatch(pipeline) {
            return flow;
        }

        let status = self.executor.run(pipeline, &self.ctx)?;
        debug!(status, "line finished");
        Ok(Flow::Continue(status))
    }

    /// Runs a line and reports any error, as the prompt loop does.
    pub fn exec_reported(&mut self, line: &str) -> Flow {
        self.exec(line).unwrap_or_else(|e| {
            eprintln!("{}: {e}", self.ctx.name);
            Flow::Continue(e.exit_status())
        })
    }

    /// Reports background jobs that finished since the last call.
    pub fn reap_background(&mut self) {
        for job in self.executor.reap_background() {
            println!("[{}] Done {}", job.leader, job.name);
        }
    }
}
