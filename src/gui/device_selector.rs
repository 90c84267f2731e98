use std::{io::stdout, path::PathBuf, time::Duration};

use crate::gui::error::GuiError;
use crate::transport::{available_ports, Endpoint};

use crossterm::{
    event::{self, KeyCode, KeyEventKind},
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

/// Lets the operator pick one of `available_ports` on a screen of its own.
/// `None` when they quit.
pub fn device_selector(available_ports: Vec<PathBuf>) -> Result<Option<Endpoint>, GuiError> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let selected = select_endpoint(&mut terminal, Vec::new(), available_ports, None);

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    selected
}

/// `fixed` first, then the serial ports not already among them.
pub(crate) fn endpoint_choices(fixed: &[Endpoint], ports: Vec<PathBuf>) -> Vec<Endpoint> {
    let mut choices = fixed.to_vec();
    for port in ports.into_iter().map(Endpoint::Serial) {
        if !choices.contains(&port) {
            choices.push(port);
        }
    }
    choices
}

/// The selector loop, drawn on an existing terminal. Offers `fixed` ahead of
/// the serial `ports`; only the ports change on refresh. `reason` is shown
/// above the list.
pub(crate) fn select_endpoint<B: Backend>(
    terminal: &mut Terminal<B>,
    fixed: Vec<Endpoint>,
    ports: Vec<PathBuf>,
    reason: Option<&str>,
) -> Result<Option<Endpoint>, GuiError> {
    let mut choices = endpoint_choices(&fixed, ports);
    let mut cursor = 0;
    let mut list_state = ListState::default().with_selected(Some(cursor));
    loop {
        let title = Title::from(" Device Selector ".magenta().bold());
        let instructions = Title::from(Line::from(vec![
            " Navigate ".into(),
            "<Up>/<Down>".magenta().bold(),
            " Select ".into(),
            "<Enter>".magenta().bold(),
            " Refresh ".into(),
            "<R>".magenta().bold(),
            " Quit ".into(),
            "<Q> ".magenta().bold(),
        ]));
        let block = Block::default()
            .title(title.alignment(Alignment::Center))
            .title(
                instructions
                    .alignment(Alignment::Center)
                    .position(Position::Bottom),
            )
            .borders(Borders::ALL);

        let mut names: Vec<String> = choices.iter().map(Endpoint::to_string).collect();
        if names.is_empty() {
            names.push("(no devices found)".to_owned());
        }
        let list = List::new(names)
            .style(Style::default().fg(Color::White))
            .highlight_symbol(">>")
            .highlight_style(Style::default().fg(Color::Magenta))
            .block(block);
        let banner = Paragraph::new(reason.unwrap_or("Pick the tactile device").to_owned())
            .style(Style::default().fg(Color::Red))
            .wrap(Wrap { trim: true });
        list_state.select(Some(cursor));

        terminal.draw(|frame| {
            let area = Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Length(2), Constraint::Min(3)])
                .split(frame.size());
            frame.render_widget(banner, area[0]);
            frame.render_stateful_widget(list, area[1], &mut list_state);
        })?;

        if !event::poll(Duration::from_millis(16))? {
            continue;
        }
        let event::Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        let n = choices.len();
        match key.code {
            KeyCode::Down if n > 0 => cursor = (cursor + 1) % n,
            KeyCode::Up if n > 0 => cursor = (cursor + n - 1) % n,
            KeyCode::Enter if n > 0 => return Ok(Some(choices.swap_remove(cursor))),
            KeyCode::Char('r') => {
                let ports = available_ports().unwrap_or_else(|error| {
                    warn!("cannot list serial ports: {error}");
                    Vec::new()
                });
                choices = endpoint_choices(&fixed, ports);
                cursor = 0;
            }
            KeyCode::Char('q') | KeyCode::Esc => return Ok(None),
            _ => {}
        }
    }
}
