use std::{fs, path::Path, sync::Arc};

use reedline::{Completer, Span, Suggestion};

use crate::{builtins::BUILTINS, path::PathTable};

/// Prints every command name starting with `prefix`, comma separated.
pub fn print_candidates(paths: &PathTable, prefix: &str) {
    let found: Vec<String> = paths.candidates(prefix).into_iter().collect();
    println!("{}", found.join(", "));
}

/// Tab completion: command names for the first word, file names afterwards.
pub struct PathCompleter {
    paths: Arc<PathTable>,
}

impl PathCompleter {
    pub fn new(paths: Arc<PathTable>) -> Self {
        Self { paths }
    }

    fn complete_commands(&self, current: &str, span: Span) -> Vec<Suggestion> {
        let mut names = self.paths.candidates(current);
        names.extend(
            BUILTINS
                .iter()
                .filter(|b| b.starts_with(current))
                .map(|b| b.to_string()),
        );

        names
            .into_iter()
            .map(|value| Suggestion {
                value,
                span,
                append_whitespace: true,
                ..Default::default()
            })
            .collect()
    }

    /// Handle file/directory completions
    fn complete_files(&self, current: &str, span: Span) -> Vec<Suggestion> {
        let last_slash = current.rfind('/').map_or(0, |i| i + 1);
        let (base, partial) = current.split_at(last_slash);
        let dir = if base.is_empty() { Path::new(".") } else { Path::new(base) };

        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let partial_span = Span::new(span.start + last_slash, span.end);

        let mut suggestions: Vec<Suggestion> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                // Skip hidden files unless explicitly requested
                if !name.starts_with(partial) || (name.starts_with('.') && !partial.starts_with('.')) {
                    return None;
                }

                let value = if entry.path().is_dir() { format!("{name}/") } else { name };
                Some(Suggestion {
                    value,
                    span: partial_span,
                    ..Default::default()
                })
            })
            .collect();
        suggestions.sort_by(|a, b| a.value.cmp(&b.value));
        suggestions
    }
}

impl Completer for PathCompleter {
    fn complete(&mut self, line: &str, pos: usize) -> Vec<Suggestion> {
        let line = &line[..pos];
        let word_start = line.rfind([' ', '\t', '|']).map_or(0, |i| i + 1);
        let span = Span::new(word_start, pos);
        let current = &line[word_start..];

        // First word of the line or of a pipeline stage
        let before = line[..word_start].trim_end();
        if before.is_empty() || before.ends_with('|') {
            self.complete_commands(current, span)
        } else {
            self.complete_files(current, span)
        }
    }
}

pub fn create_default_completer(paths: Arc<PathTable>) -> Box<dyn Completer> {
    Box::new(PathCompleter::new(paths))
}
