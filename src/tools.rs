//! External tool harness: command templates, process execution and verdicts.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crossterm::style::Stylize;
use tracing::{debug, error, info, warn};

// -----------------------------------------------------------------------------
// Templates
// -----------------------------------------------------------------------------

/// A value bound to a `{{NAME}}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Value(String),
    /// Spliced as separate arguments when the placeholder is a whole token.
    Args(Vec<String>),
}

/// Ordered placeholder bindings. The first binding for a name wins.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    pairs: Vec<(String, Binding)>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(mut self, name: &str, value: impl Into<String>) -> Self {
        self.pairs.push((name.to_string(), Binding::Value(value.into())));
        self
    }

    pub fn path(self, name: &str, value: &Path) -> Self {
        self.value(name, value.to_string_lossy().into_owned())
    }

    pub fn args<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.pairs.push((name.to_string(), Binding::Args(values)));
        self
    }

    fn get(&self, name: &str) -> Option<&Binding> {
        self.pairs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, binding)| binding)
    }
}

/// A command line with `{{NAME}}` placeholders, expanded without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: String,
    args: Vec<String>,
    stdout_to: Option<String>,
}

impl CommandTemplate {
    pub fn new(program: &str) -> Self {
        CommandTemplate {
            program: program.to_string(),
            args: Vec::new(),
            stdout_to: None,
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|a| a.to_string()));
        self
    }

    /// Redirects the tool's stdout into a file.
    pub fn stdout_to(mut self, target: &str) -> Self {
        self.stdout_to = Some(target.to_string());
        self
    }

    /// Substitutes placeholders in one pass; substituted text is never re-expanded.
    pub fn expand(&self, bindings: &Bindings) -> Invocation {
        let mut args = Vec::new();
        for token in &self.args {
            match whole_placeholder(token).and_then(|name| bindings.get(name)) {
                Some(Binding::Args(values)) => args.extend(values.iter().cloned()),
                _ => args.push(substitute(token, bindings)),
            }
        }
        Invocation {
            program: substitute(&self.program, bindings),
            args,
            stdout_to: self
                .stdout_to
                .as_ref()
                .map(|t| PathBuf::from(substitute(t, bindings))),
        }
    }
}

fn whole_placeholder(token: &str) -> Option<&str> {
    let inner = token.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        None
    } else {
        Some(inner)
    }
}

fn substitute(text: &str, bindings: &Bindings) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = &after[..close];
        match bindings.get(name) {
            Some(Binding::Value(value)) => out.push_str(value),
            Some(Binding::Args(values)) => out.push_str(&values.join(" ")),
            None => {
                out.push_str("{{");
                out.push_str(name);
                out.push_str("}}");
            }
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

/// A fully expanded command ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdout_to: Option<PathBuf>,
}

impl Invocation {
    /// Tool name for messages (file stem of the program).
    pub fn tool(&self) -> String {
        Path::new(&self.program)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }

    /// Shell-like rendering, for logs and the command record only.
    pub fn render(&self) -> String {
        let mut line = quote(&self.program);
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote(arg));
        }
        if let Some(target) = &self.stdout_to {
            line.push_str(" > ");
            line.push_str(&quote(&target.to_string_lossy()));
        }
        line
    }
}

fn quote(text: &str) -> String {
    let plain = !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,@%[]".contains(c));
    if plain {
        text.to_string()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}

// -----------------------------------------------------------------------------
// Running
// -----------------------------------------------------------------------------

/// Exit code and captured console output of one tool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolRun {
    pub code: i32,
    pub output: String,
}

pub trait ToolRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> io::Result<ToolRun>;
}

/// Runs tools as child processes, blocking until they exit.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    workdir: PathBuf,
    wine: bool,
}

impl ProcessRunner {
    pub fn new(workdir: &Path) -> Self {
        ProcessRunner {
            workdir: workdir.to_path_buf(),
            wine: false,
        }
    }

    /// Routes tools through `wine` when asked to and `wine` actually works here.
    pub fn with_wine_fallback(mut self, wanted: bool) -> Self {
        self.wine = wanted && !cfg!(windows) && wine_available();
        if wanted && !self.wine {
            warn!("wine fallback requested but wine is not usable; running tools natively");
        }
        self
    }
}

fn wine_available() -> bool {
    Command::new("wine")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

impl ToolRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<ToolRun> {
        let mut cmd = if self.wine {
            let mut cmd = Command::new("wine");
            cmd.arg(format!("{}.exe", invocation.program));
            cmd
        } else {
            Command::new(&invocation.program)
        };
        cmd.args(&invocation.args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stderr(Stdio::piped());

        match &invocation.stdout_to {
            Some(target) => {
                let target = self.workdir.join(target);
                cmd.stdout(File::create(target)?);
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }

        debug!("exec: {}", invocation.render());
        let output = cmd.output()?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ToolRun {
            code: output.status.code().unwrap_or(-1),
            output: text.trim_end().to_string(),
        })
    }
}

// -----------------------------------------------------------------------------
// Verdicts
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

impl Verdict {
    /// Reads the tone of a tool's console output.
    pub fn from_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("fail") || lower.contains("error") {
            Verdict::Fail
        } else if lower.contains("warn") || lower.contains("not found") {
            Verdict::Warn
        } else {
            Verdict::Pass
        }
    }

    /// A non-zero exit or a missing output is a failure whatever the text says.
    pub fn of_stage(run: &ToolRun, produced_output: bool) -> Self {
        if run.code != 0 || !produced_output {
            Verdict::Fail
        } else {
            Self::from_text(&run.output)
        }
    }
}

/// Logs a finished stage and, when `echo` is set, prints it coloured.
pub fn report(invocation: &Invocation, run: &ToolRun, verdict: Verdict, echo: bool) {
    let summary = format!("Returned: {} ({:#x})", run.code, run.code);
    if echo {
        // Echoed runs already reach the console in colour.
        debug!("{}: {summary}", invocation.tool());
        let text = if run.output.is_empty() {
            summary
        } else {
            format!("{}\n{summary}", run.output)
        };
        match verdict {
            Verdict::Pass => println!("{}", text.green()),
            Verdict::Warn => println!("{}", text.yellow()),
            Verdict::Fail => println!("{}", text.red()),
        }
        return;
    }
    match verdict {
        Verdict::Pass => info!("{}: {summary}", invocation.tool()),
        Verdict::Warn => warn!("{}: {summary}\n{}", invocation.tool(), run.output),
        Verdict::Fail => error!(
            "{} failed: {summary}\n{}\n{}",
            invocation.tool(),
            invocation.render(),
            run.output
        ),
    }
}

/// Appends a command and its exit code to a per-worker record for later replay.
pub fn record_command(log: &Path, invocation: &Invocation, code: i32) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(log)?;
    write!(
        file,
        "{}\r\nREM Returned: {code} [{code:#x}]\r\n\r\n",
        invocation.render()
    )
}

pub fn command_log_name(worker_id: usize) -> String {
    format!(".cook[{worker_id}].bat")
}
