use std::{
    io::{stdout, Stdout},
    time::{Duration, Instant},
};

use crate::engine::{Frontend, Progress, Response};
use crate::gui::{device_selector::select_endpoint, error::GuiError};
use crate::stage::{Dismiss, Stage, StageKind};
use crate::transport::{available_ports, Endpoint, TransportError};

use crossterm::{
    event::{self, KeyCode, KeyEventKind, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use log::warn;
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

/// Whether `code` is the key a prompt names, e.g. `F4`, `space`, `enter` or
/// a single character.
pub fn key_matches(name: &str, code: KeyCode) -> bool {
    let name = name.trim();
    match code {
        KeyCode::F(n) => name.eq_ignore_ascii_case(&format!("f{n}")),
        KeyCode::Enter => name.eq_ignore_ascii_case("enter") || name.eq_ignore_ascii_case("return"),
        KeyCode::Char(' ') => name.eq_ignore_ascii_case("space"),
        KeyCode::Char(c) => {
            let mut chars = name.chars();
            matches!((chars.next(), chars.next()), (Some(n), None) if n.eq_ignore_ascii_case(&c))
        }
        _ => false,
    }
}

/// What a key press means for `stage`, `elapsed` after it was shown. Moves
/// `cursor` through a trial's options.
pub fn interpret(stage: &Stage, code: KeyCode, cursor: &mut usize, elapsed: Duration) -> Option<Response> {
    let confirm = matches!(code, KeyCode::Enter | KeyCode::Char(' '));
    let enabled = |after_ms: u64| elapsed >= Duration::from_millis(after_ms);

    match &stage.kind {
        StageKind::ForcedChoiceTrial { options, .. } => {
            let n = options.len();
            if n == 0 {
                return None;
            }
            match code {
                KeyCode::Down | KeyCode::Right => *cursor = (*cursor + 1) % n,
                KeyCode::Up | KeyCode::Left => *cursor = (*cursor + n - 1) % n,
                KeyCode::Enter => return options.get(*cursor).cloned().map(Response::Select),
                KeyCode::Char(c) => {
                    let picked = c.to_digit(10).and_then(|d| (d as usize).checked_sub(1));
                    if let Some(option) = picked.and_then(|i| options.get(i)) {
                        return Some(Response::Select(option.clone()));
                    }
                }
                _ => {}
            }
            None
        }
        StageKind::Prompt { dismiss, .. } => match dismiss {
            Dismiss::Key(name) if key_matches(name, code) => Some(Response::Dismiss),
            Dismiss::Button {
                enable_after_ms, ..
            } if confirm && enabled(*enable_after_ms) => Some(Response::Dismiss),
            _ => None,
        },
        StageKind::Break { .. } if confirm => Some(Response::Dismiss),
        StageKind::InstructionWithMedia {
            enable_after_ms, ..
        } if confirm && enabled(*enable_after_ms) => Some(Response::Dismiss),
        _ => None,
    }
}

/// Runs a session on the terminal. Owns the alternate screen while alive.
pub struct TerminalPresenter {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    progress: Progress,
    shown_at: Instant,
    cursor: usize,
    input_open: bool,
    playing: bool,
    status: Option<String>,
}

impl TerminalPresenter {
    /// Takes over the terminal.
    pub fn new() -> Result<Self, GuiError> {
        enable_raw_mode()?;
        stdout().execute(EnterAlternateScreen)?;
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
        terminal.clear()?;

        Ok(TerminalPresenter {
            terminal,
            progress: Progress {
                completed: 0,
                total: 0,
            },
            shown_at: Instant::now(),
            cursor: 0,
            input_open: false,
            playing: false,
            status: None,
        })
    }

    fn hint(&self, stage: &Stage) -> String {
        if !self.input_open {
            return if self.playing { "Feel..." } else { "Get ready..." }.to_owned();
        }
        match &stage.kind {
            StageKind::ForcedChoiceTrial { .. } => {
                "<Up>/<Down> or a number to choose, <Enter> to confirm".to_owned()
            }
            StageKind::Prompt {
                dismiss: Dismiss::Key(name),
                ..
            } => format!("Press <{name}>"),
            StageKind::Prompt {
                dismiss: Dismiss::Button { label, .. },
                ..
            }
            | StageKind::InstructionWithMedia {
                button_label: label,
                ..
            } => format!("<Enter> {label}"),
            StageKind::Prompt { .. } => String::new(),
            StageKind::Break { .. } => "<Enter> Continue".to_owned(),
        }
    }

    fn draw(&mut self, stage: &Stage) {
        let title = Title::from(" VibroTrial ".magenta().bold());
        let counter = Title::from(format!(
            " {}/{} ",
            (self.progress.completed + 1).min(self.progress.total),
            self.progress.total
        ));
        let hint = Title::from(Span::styled(
            self.hint(stage),
            Style::default().fg(Color::Magenta).add_modifier(Modifier::BOLD),
        ));
        let block = Block::default()
            .title(title.alignment(Alignment::Center))
            .title(counter.alignment(Alignment::Right))
            .title(hint.alignment(Alignment::Center).position(Position::Bottom))
            .borders(Borders::ALL);

        let mut body = stage.text().unwrap_or_default().to_owned();
        if let StageKind::InstructionWithMedia {
            media: Some(media), ..
        } = &stage.kind
        {
            body.push_str(&format!("\n\n[{}]", media.display()));
        }
        let options: Vec<String> = stage
            .options()
            .iter()
            .enumerate()
            .map(|(i, option)| format!("{}. {option}", i + 1))
            .collect();
        let mut list_state = ListState::default().with_selected(
            (self.input_open && !options.is_empty()).then_some(self.cursor),
        );
        let list = List::new(options)
            .style(Style::default().fg(Color::White))
            .highlight_symbol(">>")
            .highlight_style(Style::default().fg(Color::Magenta));
        let status = Paragraph::new(self.status.clone().unwrap_or_default())
            .style(Style::default().fg(Color::Red))
            .wrap(Wrap { trim: true });
        let text = Paragraph::new(body).wrap(Wrap { trim: false });

        let drawn = self.terminal.draw(|frame| {
            let outer = frame.size();
            let inner = block.inner(outer);
            frame.render_widget(block, outer);
            let area = Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Min(1), Constraint::Length(2)])
                .split(inner);
            if stage.options().is_empty() {
                frame.render_widget(text, area[0]);
            } else {
                frame.render_stateful_widget(list, area[0], &mut list_state);
            }
            frame.render_widget(status, area[1]);
        });
        if let Err(error) = drawn {
            warn!("cannot draw: {error}");
        }
    }
}

impl Drop for TerminalPresenter {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = stdout().execute(LeaveAlternateScreen);
    }
}

impl Frontend for TerminalPresenter {
    fn show(&mut self, stage: &Stage, progress: Progress) {
        self.progress = progress;
        self.shown_at = Instant::now();
        self.cursor = 0;
        self.input_open = false;
        self.playing = false;
        self.draw(stage);
    }

    fn stimulus_cue(&mut self, stage: &Stage) {
        self.playing = true;
        self.draw(stage);
    }

    fn input_opened(&mut self, stage: &Stage) {
        self.input_open = true;
        self.playing = false;
        self.draw(stage);
    }

    fn device_error(&mut self, stage: &Stage, error: &TransportError) {
        self.status = Some(format!("Device error: {error}"));
        self.draw(stage);
    }

    fn collect(&mut self, stage: &Stage, wait: Duration) -> Option<Response> {
        self.draw(stage);
        let key = match event::poll(wait).and_then(|ready| ready.then(event::read).transpose()) {
            Ok(Some(event::Event::Key(key))) if key.kind == KeyEventKind::Press => key,
            Ok(_) => return None,
            Err(error) => {
                warn!("cannot read the terminal: {error}");
                return None;
            }
        };

        if key.code == KeyCode::Esc
            || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL))
        {
            return Some(Response::Quit);
        }
        if !self.input_open {
            return None;
        }
        let response = interpret(stage, key.code, &mut self.cursor, self.shown_at.elapsed());
        if response.is_some() {
            self.status = None;
        }
        response
    }

    fn reselect_device(&mut self, failed: &Endpoint, error: &TransportError) -> Option<Endpoint> {
        let ports = available_ports().unwrap_or_else(|error| {
            warn!("cannot list serial ports: {error}");
            Vec::new()
        });
        let reason = format!("Device error: {error}. Pick a device to continue.");
        match select_endpoint(&mut self.terminal, vec![failed.clone()], ports, Some(&reason)) {
            Ok(endpoint) => {
                self.status = None;
                endpoint
            }
            Err(error) => {
                warn!("device selector failed: {error}");
                None
            }
        }
    }

    fn notify(&mut self, message: &str) {
        self.status = Some(message.to_owned());
    }
}
