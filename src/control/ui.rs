use std::collections::VecDeque;
use std::error::Error;
use std::io::stdout;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use crossbeam_channel::unbounded;
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event as CEvent, KeyCode, KeyEvent};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction as LayoutDirection, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, Wrap};

use crate::control::api::{self, DriverStatus};
use crate::dsp::Direction;
use crate::manager::DeviceManager;
use crate::playback::PlaybackStream;
use crate::pop_log;

const TICK_RATE: Duration = Duration::from_millis(100);
const TONE_LENGTH: Duration = Duration::from_secs(2);
const JOURNAL_LINES: usize = 4;

#[derive(Default)]
struct AppState {
    status: Option<DriverStatus>,
    selected: usize,
    mode: Mode,
    message: Option<String>,
    journal: VecDeque<String>,
    tone: Option<PlaybackStream>,
    last_update: Option<Instant>,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    #[default]
    Normal,
    VolumeInput,
}

struct VolumeEditor {
    buffer: String,
}

/// Run the ratatui-based developer console against `manager`.
pub fn run(manager: Arc<DeviceManager>) -> Result<(), Box<dyn Error>> {
    setup_terminal()?;

    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let (status_tx, status_rx) = unbounded();
    let poller = Arc::clone(&manager);
    std::thread::spawn(move || {
        loop {
            let status = api::get_status(&poller);
            if status_tx.send(status).is_err() {
                break;
            }
            std::thread::sleep(TICK_RATE);
        }
    });

    let mut app = AppState::default();
    let mut volume_editor: Option<VolumeEditor> = None;

    loop {
        terminal.draw(|frame| draw(frame, &app, volume_editor.as_ref()))?;

        if let Some(status) = try_recv_latest(&status_rx) {
            let device_len = status.devices.len();
            app.status = Some(status);
            app.last_update = Some(Instant::now());
            app.selected = app.selected.min(device_len.saturating_sub(1));
        }
        while let Some(line) = pop_log() {
            app.journal.push_back(line);
            while app.journal.len() > JOURNAL_LINES {
                app.journal.pop_front();
            }
        }

        if event::poll(Duration::from_millis(10))? {
            if let CEvent::Key(key) = event::read()? {
                if handle_key(&manager, &mut app, &mut volume_editor, key) {
                    break;
                }
            }
        }
    }

    app.tone.take();
    restore_terminal()?;
    Ok(())
}

fn setup_terminal() -> Result<(), Box<dyn Error>> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    Ok(())
}

fn restore_terminal() -> Result<(), Box<dyn Error>> {
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    Ok(())
}

fn try_recv_latest<T>(rx: &Receiver<T>) -> Option<T> {
    let mut last = None;
    while let Ok(value) = rx.try_recv() {
        last = Some(value);
    }
    last
}

fn handle_key(
    manager: &DeviceManager,
    app: &mut AppState,
    volume_editor: &mut Option<VolumeEditor>,
    key: KeyEvent,
) -> bool {
    match app.mode {
        Mode::Normal => match key.code {
            KeyCode::Char('q') => return true,
            KeyCode::Up => {
                app.selected = app.selected.saturating_sub(1);
            }
            KeyCode::Down => {
                let device_len = app.status.as_ref().map_or(0, |s| s.devices.len());
                if app.selected + 1 < device_len {
                    app.selected += 1;
                }
            }
            KeyCode::Char('t') => {
                if app.tone.take().is_some() {
                    app.message = Some("Tone stopped".to_string());
                } else {
                    match api::play_tone(manager, app.selected, TONE_LENGTH) {
                        Ok(stream) => {
                            app.message = Some(format!(
                                "Playing tone on device {} at {}",
                                app.selected,
                                stream.format()
                            ));
                            app.tone = Some(stream);
                        }
                        Err(err) => app.message = Some(format!("Tone failed: {err}")),
                    }
                }
            }
            KeyCode::Char('v') => {
                let current = app
                    .status
                    .as_ref()
                    .and_then(|s| s.volumes.get(app.selected).copied().flatten());
                if let Some((left, _)) = current {
                    volume_editor.replace(VolumeEditor {
                        buffer: left.to_string(),
                    });
                    app.mode = Mode::VolumeInput;
                } else {
                    app.message = Some("Device has no mixer".to_string());
                }
            }
            _ => {}
        },
        Mode::VolumeInput => match key.code {
            KeyCode::Esc => {
                volume_editor.take();
                app.mode = Mode::Normal;
            }
            KeyCode::Enter => {
                if let Some(editor) = volume_editor.take() {
                    if let Ok(value) = editor.buffer.trim().parse::<u8>() {
                        let percent = value.min(100);
                        app.message = Some(match api::set_volume(manager, app.selected, percent) {
                            Ok(()) => format!("Set device {} volume to {percent}%", app.selected),
                            Err(err) => format!("Volume failed: {err}"),
                        });
                    }
                }
                app.mode = Mode::Normal;
            }
            KeyCode::Backspace => {
                if let Some(editor) = volume_editor.as_mut() {
                    editor.buffer.pop();
                }
            }
            KeyCode::Char(c) => {
                if let Some(editor) = volume_editor.as_mut() {
                    if c.is_ascii_digit() && editor.buffer.len() < 3 {
                        editor.buffer.push(c);
                    }
                }
            }
            _ => {}
        },
    }
    false
}

fn draw(frame: &mut ratatui::Frame<'_>, app: &AppState, volume_editor: Option<&VolumeEditor>) {
    let chunks = Layout::default()
        .direction(LayoutDirection::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(4 + JOURNAL_LINES as u16),
        ])
        .split(frame.size());

    draw_header(frame, chunks[0], app);
    draw_devices(frame, chunks[1], app);
    draw_footer(frame, chunks[2], app);

    if let Some(editor) = volume_editor {
        let area = Layout::default()
            .direction(LayoutDirection::Vertical)
            .constraints([Constraint::Min(0), Constraint::Length(3)])
            .split(frame.size())[1];

        let block = Block::default()
            .title("Set Volume (%): Enter to apply, Esc to cancel")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow));

        let paragraph = Paragraph::new(editor.buffer.clone())
            .block(block)
            .wrap(Wrap { trim: false });

        frame.render_widget(Clear, area);
        frame.render_widget(paragraph, area);
    }
}

fn draw_header(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("DSP Console").borders(Borders::ALL);

    let content = match &app.status {
        Some(status) if !status.devices.is_empty() => {
            let open = status.devices.iter().filter(|d| d.open_count > 0).count();
            Paragraph::new(format!(
                "Backend: {}    Devices: {}    Open: {}",
                status.backend,
                status.devices.len(),
                open
            ))
        }
        _ => Paragraph::new(Line::from(vec![Span::styled(
            "No usable devices",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )])),
    };

    frame.render_widget(content.block(block), area);
}

fn draw_devices(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Devices").borders(Borders::ALL);

    let Some(status) = &app.status else {
        frame.render_widget(Paragraph::new("").block(block), area);
        return;
    };

    let header = Row::new(vec![
        Cell::from(""),
        Cell::from("Path"),
        Cell::from("Open"),
        Cell::from("Out"),
        Cell::from("In"),
        Cell::from("Format"),
        Cell::from("Fragments"),
        Cell::from("Volume"),
        Cell::from("Caps"),
    ])
    .style(
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    );

    let rows = status.devices.iter().enumerate().map(|(idx, device)| {
        let indicator = if idx == app.selected { ">" } else { "" };
        let format = device
            .format
            .map(|f| f.to_string())
            .unwrap_or_else(|| "-".to_string());
        let fragments = if device.geometry.fragments > 0 {
            format!(
                "{} x {}",
                device.geometry.fragments, device.geometry.fragment_size
            )
        } else {
            "-".to_string()
        };
        let volume = match status.volumes.get(idx).copied().flatten() {
            Some((left, right)) => format!("{left}/{right}"),
            None => "-".to_string(),
        };
        let mut row = Row::new(vec![
            Cell::from(indicator.to_string()),
            Cell::from(device.path.clone()),
            Cell::from(device.open_count.to_string()),
            Cell::from(api::armed_label(device, Direction::Output)),
            Cell::from(api::armed_label(device, Direction::Input)),
            Cell::from(format),
            Cell::from(fragments),
            Cell::from(volume),
            Cell::from(format!("{:?}", device.capabilities)),
        ]);
        if idx == app.selected {
            row = row.style(Style::default().fg(Color::Yellow));
        }
        row
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(2),
            Constraint::Length(14),
            Constraint::Length(5),
            Constraint::Length(4),
            Constraint::Length(4),
            Constraint::Length(26),
            Constraint::Length(12),
            Constraint::Length(8),
            Constraint::Min(20),
        ],
    )
    .header(header)
    .block(block)
    .column_spacing(2);

    frame.render_widget(table, area);
}

fn draw_footer(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let info = "Up/Down: Select  •  t: Toggle tone  •  v: Set volume  •  q: Quit";
    let mut lines = vec![Line::from(info)];
    if let Some(message) = &app.message {
        lines.push(Line::from(Span::styled(
            message.clone(),
            Style::default().fg(Color::Green),
        )));
    }
    for entry in &app.journal {
        lines.push(Line::from(Span::styled(
            entry.clone(),
            Style::default().fg(Color::Gray),
        )));
    }
    if let Some(updated) = app.last_update {
        let ago = updated.elapsed().as_secs_f32();
        lines.push(Line::from(Span::styled(
            format!("Last update {:.1}s ago", ago),
            Style::default().fg(Color::DarkGray),
        )));
    }

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}
