use std::ffi::{CString, NulError};
use std::ptr;

use tracing::trace;

// Only spaces and tabs separate tokens
const SPLITTERS: &[char] = &[' ', '\t'];
const PIPE: &str = "|";
const BACKGROUND: &str = "&";

/// Explicit stream redirections of a single stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Redirects {
    pub stdin: Option<String>,    // <
    pub truncate: Option<String>, // >
    pub append: Option<String>,   // >>
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RedirectSlot {
    Stdin,
    Truncate,
    Append,
}

impl RedirectSlot {
    // `>>` must be tried before `>`
    fn split(token: &str) -> Option<(Self, &str)> {
        if let Some(rest) = token.strip_prefix('<') {
            Some((Self::Stdin, rest))
        } else if let Some(rest) = token.strip_prefix(">>") {
            Some((Self::Append, rest))
        } else {
            token.strip_prefix('>').map(|rest| (Self::Truncate, rest))
        }
    }
}

impl Redirects {
    fn set(&mut self, slot: RedirectSlot, target: String) {
        let field = match slot {
            RedirectSlot::Stdin => &mut self.stdin,
            RedirectSlot::Truncate => &mut self.truncate,
            RedirectSlot::Append => &mut self.append,
        };
        *field = Some(target);
    }
}

/// One stage of a pipeline.
///
/// `args[0]` always duplicates `name`; an empty `name` means "no command".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
    pub background: bool,
    pub autocomplete: bool,
    pub redirects: Redirects,
    pub next: Option<Box<Command>>,
}

impl Command {
    /// Builds the exec-ready argument vector for this stage.
    pub fn argv(&self) -> Result<Argv, NulError> {
        Argv::new(&self.args)
    }
}

/// NUL-terminated argument strings followed by a null pointer sentinel,
/// laid out the way `execv` expects them.
#[derive(Debug)]
pub struct Argv {
    // Owns the storage `ptrs` points into
    _strings: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl Argv {
    pub fn new<S: AsRef<str>>(args: &[S]) -> Result<Self, NulError> {
        let strings = args
            .iter()
            .map(|a| CString::new(a.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let ptrs = strings
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();

        Ok(Self {
            _strings: strings,
            ptrs,
        })
    }

    pub fn as_ptr(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }
}

/// A parsed input line: a non-empty chain of [`Command`]s linked through `next`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    root: Command,
}

impl Pipeline {
    pub fn root(&self) -> &Command {
        &self.root
    }

    pub fn stages(&self) -> Stages<'_> {
        Stages {
            next: Some(&self.root),
        }
    }

    pub fn len(&self) -> usize {
        self.stages().count()
    }

    /// A blank line parses to a single nameless stage.
    pub fn is_noop(&self) -> bool {
        self.root.name.is_empty()
    }

    pub fn background(&self) -> bool {
        self.root.background
    }

    pub fn autocomplete(&self) -> bool {
        self.root.autocomplete
    }
}

pub struct Stages<'a> {
    next: Option<&'a Command>,
}

impl<'a> Iterator for Stages<'a> {
    type Item = &'a Command;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.next.as_deref();
        Some(current)
    }
}

// Main parsing function - entry point
pub fn parse(line: &str) -> Pipeline {
    let mut line = line.trim_matches(SPLITTERS);
    let mut autocomplete = false;
    let mut background = false;

    // Trailing hint characters apply to the whole line
    if let Some(rest) = line.strip_suffix('?') {
        autocomplete = true;
        line = rest.trim_end_matches(SPLITTERS);
    } else if let Some(rest) = line.strip_suffix('&') {
        background = true;
        line = rest.trim_end_matches(SPLITTERS);
    }

    let tokens: Vec<&str> = line.split(SPLITTERS).filter(|t| !t.is_empty()).collect();

    // Link stages back to front so every node owns its successor
    let mut next: Option<Command> = None;
    for group in tokens.split(|t| *t == PIPE).rev() {
        let mut command = parse_stage(group);
        command.background = background;
        command.autocomplete = autocomplete;
        command.next = next.map(Box::new);
        next = Some(command);
    }

    let pipeline = Pipeline {
        root: next.unwrap_or_default(),
    };
    trace!(?pipeline, "parsed input line");
    pipeline
}

// Classifies the tokens of a single stage
fn parse_stage(tokens: &[&str]) -> Command {
    let Some((name, rest)) = tokens.split_first() else {
        return Command::default();
    };

    let mut command = Command {
        name: name.to_string(),
        args: vec![name.to_string()],
        ..Default::default()
    };

    let mut rest = rest.iter();
    while let Some(&token) = rest.next() {
        if token == BACKGROUND {
            continue;
        }

        if let Some((slot, target)) = RedirectSlot::split(token) {
            // A bare marker takes the following token as its target
            let target = if target.is_empty() {
                match rest.next() {
                    Some(next) => *next,
                    None => continue,
                }
            } else {
                target
            };
            command.redirects.set(slot, target.to_string());
            continue;
        }

        command.args.push(strip_quotes(token).to_string());
    }

    command
}

fn strip_quotes(token: &str) -> &str {
    if token.len() < 3 {
        return token;
    }
    ['"', '\'']
        .into_iter()
        .find_map(|q| token.strip_prefix(q).and_then(|t| t.strip_suffix(q)))
        .unwrap_or(token)
}
