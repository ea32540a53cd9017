use reedline::{Prompt, PromptEditMode, PromptHistorySearch};
use std::{borrow::Cow, env, ffi::CStr};

pub struct SimplePrompt {
    custom_prompt: Option<Cow<'static, str>>,
    shell_name: String,
}

impl SimplePrompt {
    pub fn new(config: &crate::config::Config) -> Self {
        let custom_prompt = config
            .prompt
            .as_ref()
            .map(|s| Cow::Owned(s.to_string()));

        Self {
            custom_prompt,
            shell_name: config.name.clone(),
        }
    }
}

fn hostname() -> String {
    let mut buf = [0 as libc::c_char; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len() - 1) };
    if rc != 0 {
        return "localhost".into();
    }
    // SAFETY: the last byte is never written, so the buffer is NUL terminated
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// `user@host:cwd name$ `
fn render(user: &str, host: &str, cwd: &str, shell_name: &str) -> String {
    format!("{user}@{host}:{cwd} {shell_name}$ ")
}

impl Prompt for SimplePrompt {
    fn render_prompt_left(&self) -> Cow<'static, str> {
        if let Some(ref prompt) = self.custom_prompt {
            return prompt.clone();
        }

        let user = env::var("USER").unwrap_or_default();
        let cwd = env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "?".into());

        Cow::Owned(render(&user, &hostname(), &cwd, &self.shell_name))
    }

    fn render_prompt_right(&self) -> Cow<'static, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, _mode: PromptEditMode) -> Cow<'static, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<'static, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_history_search_indicator(&self, _history_search: PromptHistorySearch) -> Cow<'static, str> {
        Cow::Borrowed("? ")
    }
}
