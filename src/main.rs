use std::env;
use std::io;
use std::panic;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Terminal,
};
use tracing::{error, info};

use cooker::logging::{self, LogTarget, LOG_FILE};
use cooker::{CookError, CookHandle, CookOptions, Cooker, CookerConfig, Cooking, ProgressTracker};

const USAGE: &str = "usage: cook [MASKS] [--sync] [--workers N] [--level L] [--root DIR]";

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Cook(#[from] CookError),
    #[error(transparent)]
    Logging(#[from] logging::LoggingError),
    #[error("Terminal error: {0}")]
    Terminal(#[from] io::Error),
}

// ------------------------- Arguments --------------------------------------

#[derive(Debug)]
struct Args {
    masks: String,
    sync: bool,
    workers: Option<usize>,
    level: Option<u32>,
    root: Option<PathBuf>,
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> Result<Args, CliError> {
    let mut args = Args {
        masks: "**".into(),
        sync: false,
        workers: None,
        level: None,
        root: None,
    };
    let mut masks_seen = false;

    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--sync" => args.sync = true,
            "--workers" => args.workers = Some(number(&arg, raw.next())?),
            "--level" => args.level = Some(number(&arg, raw.next())?),
            "--root" => {
                let dir = raw
                    .next()
                    .ok_or_else(|| CliError::Usage("--root needs a directory".into()))?;
                args.root = Some(PathBuf::from(dir));
            }
            "-h" | "--help" => {
                return Err(CliError::Usage("cooks project assets into .cook[N].zip shards".into()))
            }
            flag if flag.starts_with("--") => {
                return Err(CliError::Usage(format!("unknown option {flag}")))
            }
            _ if !masks_seen => {
                args.masks = arg.clone();
                masks_seen = true;
            }
            _ => return Err(CliError::Usage(format!("unexpected argument {arg}"))),
        }
    }
    Ok(args)
}

fn number<T: std::str::FromStr>(flag: &str, value: Option<String>) -> Result<T, CliError> {
    value
        .as_deref()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| CliError::Usage(format!("{flag} needs a number")))
}

// ------------------------- Dashboard --------------------------------------

struct Dashboard {
    progress: Arc<ProgressTracker>,
    workers: usize,
    root: String,
    tick: usize,
}

impl Dashboard {
    fn status(&self, finished: bool) -> String {
        if finished {
            "Done. [Q] Close".into()
        } else {
            let spinner = ["|", "/", "-", "\\"][(self.tick / 3) % 4];
            format!("{spinner} Cooking... [Q] Detach | [Esc] Detach")
        }
    }
}

/// Draws per-shard gauges until the workers finish or the user detaches.
fn run_dashboard(dash: &mut Dashboard, handle: &CookHandle, ready: &AtomicBool) -> Result<(), CliError> {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        original_hook(panic_info);
    }));

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    ready.store(true, Ordering::Release);

    let mut lingering = 0;
    loop {
        let finished = handle.is_finished();
        terminal.draw(|f| {
            let mut constraints = vec![Constraint::Length(1)];
            constraints.extend((0..dash.workers).map(|_| Constraint::Length(3)));
            constraints.push(Constraint::Length(3));
            constraints.push(Constraint::Min(0));
            constraints.push(Constraint::Length(3));
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints(constraints)
                .split(f.size());

            let header = Line::from(vec![
                Span::styled(" cook ", Style::default().add_modifier(Modifier::BOLD)),
                Span::raw(dash.root.as_str()),
            ]);
            f.render_widget(Paragraph::new(header), chunks[0]);

            for (id, value) in dash.progress.snapshot(dash.workers).into_iter().enumerate() {
                let color = if value >= 100 { Color::Green } else { Color::Yellow };
                let gauge = Gauge::default()
                    .block(
                        Block::default()
                            .borders(Borders::ALL)
                            .title(format!(" .cook[{id}].zip ")),
                    )
                    .gauge_style(Style::default().fg(color))
                    .percent(value.clamp(0, 100) as u16);
                f.render_widget(gauge, chunks[1 + id]);
            }

            let overall = Gauge::default()
                .block(Block::default().borders(Borders::ALL).title(" Overall "))
                .gauge_style(Style::default().fg(Color::Cyan))
                .percent(dash.progress.aggregate().clamp(0, 100) as u16);
            f.render_widget(overall, chunks[dash.workers + 1]);

            f.render_widget(
                Paragraph::new(dash.status(finished)).block(Block::default().borders(Borders::ALL)),
                chunks[dash.workers + 3],
            );
        })?;
        dash.tick = dash.tick.wrapping_add(1);

        if finished {
            lingering += 1;
            if lingering > 10 {
                break;
            }
        }

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => break,
                        _ => {}
                    }
                }
            }
        }
    }

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    Ok(())
}

// ------------------------- main -------------------------------------------

fn run() -> Result<bool, CliError> {
    let args = parse_args(env::args().skip(1))?;
    let root = match &args.root {
        Some(root) => root.clone(),
        None => env::current_dir()?,
    };

    let mut config = CookerConfig::load(&root).map_err(CookError::from)?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(level) = args.level {
        config.compression_level = level;
    }

    if args.sync {
        logging::init(LogTarget::Stdout)?;
        let cooker = Cooker::with_root(root, config);
        let transform = cooker.default_transform();
        let Cooking::Finished(report) = cooker.cook(&args.masks, transform, CookOptions::sync())?
        else {
            return Ok(false);
        };
        info!(
            "+{} ~{} -{} | cooked {} bypassed {} failed {}",
            report.added, report.changed, report.deleted, report.cooked, report.bypassed, report.failed
        );
        return Ok(report.failed == 0);
    }

    logging::init(LogTarget::File(root.join(LOG_FILE)))?;
    config.echo_tools = false;
    let cooker = Cooker::with_root(root, config);
    let ready = Arc::new(AtomicBool::new(false));
    let transform = cooker.default_transform();
    let Cooking::Launched(handle) =
        cooker.cook(&args.masks, transform, CookOptions::background(Some(ready.clone())))?
    else {
        return Ok(false);
    };

    let mut dash = Dashboard {
        progress: cooker.progress_tracker(),
        workers: handle.shard_count(),
        root: cooker.root().display().to_string(),
        tick: 0,
    };
    let shown = run_dashboard(&mut dash, &handle, &ready);
    // Workers must not wait forever if the terminal could not be set up.
    ready.store(true, Ordering::Release);
    shown?;

    if !handle.is_finished() {
        println!("waiting for {} shards to finish...", handle.shard_count());
    }
    let reports = handle.wait()?;
    let failed: usize = reports.iter().map(|r| r.failed).sum();
    let cooked: usize = reports.iter().map(|r| r.cooked).sum();
    println!("cooked {cooked} files into {} shards, {failed} failed", reports.len());
    Ok(failed == 0)
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(CliError::Usage(msg)) => {
            eprintln!("cook: {msg}\n{USAGE}");
            ExitCode::from(2)
        }
        Err(err) => {
            error!("{err}");
            eprintln!("cook: {err}");
            ExitCode::from(2)
        }
    }
}
