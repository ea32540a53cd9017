mod builtins;
mod completions;
mod config;
mod error;
mod parse;
mod path;
mod process_exec;
mod prompt;
mod shell;

use std::sync::Arc;

use anyhow::Context as _;
use nu_ansi_term::{Color, Style};
use reedline::{
    ColumnarMenu, DefaultHinter, Emacs, FileBackedHistory, KeyCode, KeyModifiers, MenuBuilder,
    Reedline, ReedlineEvent, ReedlineMenu, Signal, default_emacs_keybindings,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    builtins::Flow,
    completions::create_default_completer,
    path::PathTable,
    prompt::SimplePrompt,
    shell::{Context, Shell},
};

const HISTORY_CAPACITY: usize = 1000;

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they never end up in a pipeline
    let filter = EnvFilter::try_from_env("PIPESH_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // [1] Load configuration and the search path
    let cfg = config::init();
    let paths = Arc::new(PathTable::from_env());
    debug!(dirs = paths.dirs().len(), "search path loaded");

    let mut shell = Shell::new(Context {
        name: cfg.name.clone(),
        paths: Arc::clone(&paths),
    });

    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
        libc::signal(libc::SIGQUIT, libc::SIG_IGN);
    }

    if config::run_startup(&cfg, &mut shell) == Flow::Exit {
        return Ok(());
    }

    // [2] Prompt, history and completion
    let prompt = SimplePrompt::new(&cfg);

    let history = match config::history_file_path() {
        Some(path) => FileBackedHistory::with_file(HISTORY_CAPACITY, path).unwrap_or_else(|e| {
            warn!("history disabled: {e}");
            FileBackedHistory::default()
        }),
        None => FileBackedHistory::default(),
    };

    let menu = ReedlineMenu::EngineCompleter(Box::new(
        ColumnarMenu::default()
            .with_name("completion_menu")
            .with_column_width(Some(20)),
    ));

    let mut keybindings = default_emacs_keybindings();
    keybindings.add_binding(
        KeyModifiers::NONE,
        KeyCode::Tab,
        ReedlineEvent::UntilFound(vec![
            ReedlineEvent::Menu("completion_menu".into()),
            ReedlineEvent::MenuNext,
        ]),
    );

    // [3] Build the line editor
    let mut editor = Reedline::create()
        .with_history(Box::new(history))
        .with_completer(create_default_completer(paths))
        .with_menu(menu)
        .with_hinter(Box::new(
            DefaultHinter::default()
                .with_style(Style::new().italic().fg(Color::DarkGray))
                .with_min_chars(1),
        ))
        .with_edit_mode(Box::new(Emacs::new(keybindings)));

    // [4] Main REPL loop
    loop {
        shell.reap_background();

        match editor.read_line(&prompt).context("failed to read input")? {
            Signal::Success(buf) => {
                if shell.exec_reported(&buf) == Flow::Exit {
                    break;
                }
            }
            Signal::CtrlD => break,
            _ => continue,
        }
    }

    println!();
    Ok(())
}
