use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout},
    style::{Color, Style},
    text::Line,
    widgets::{Block, Borders, Paragraph},
    Frame, Terminal,
};
use scopelog::{
    events::PipelineEvent,
    frame::Sample,
    gui::GuiError,
    link::ConnectionState,
    session::RecorderState,
    stats::StatsAccumulator,
};
use std::{
    io,
    path::PathBuf,
    sync::mpsc::{Receiver, TryRecvError},
    time::{Duration, Instant},
};

/// Everything the dashboard shows, folded out of the event feed.
struct App {
    events: Receiver<PipelineEvent>,
    stats: StatsAccumulator,
    connection: ConnectionState,
    recording: RecorderState,
    last_sample: Option<Sample>,
    known_ports: Vec<PathBuf>,
    bad_frames: u64,
    last_notice: Option<String>,
    feed_alive: bool,
}

impl App {
    fn new(events: Receiver<PipelineEvent>) -> App {
        App {
            events,
            stats: StatsAccumulator::new(),
            connection: ConnectionState::Disconnected,
            recording: RecorderState::Idle,
            last_sample: None,
            known_ports: Vec::new(),
            bad_frames: 0,
            last_notice: None,
            feed_alive: true,
        }
    }

    fn on_tick(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(PipelineEvent::SampleReceived(sample)) => {
                    self.stats.record(sample);
                    self.last_sample = Some(sample);
                }
                Ok(PipelineEvent::ConnectionStateChanged(state)) => self.connection = state,
                Ok(PipelineEvent::RecordingStateChanged(state)) => self.recording = state,
                Ok(PipelineEvent::ParseError { detail, suppressed }) => {
                    self.bad_frames += 1 + suppressed;
                    self.last_notice = Some(format!("bad frame: {}", detail));
                }
                Ok(PipelineEvent::PersistenceError(detail)) => {
                    self.last_notice = Some(format!("persistence: {}", detail));
                }
                Ok(PipelineEvent::BackupCompleted(path)) => {
                    self.last_notice = Some(format!("backed up {}", path.display()));
                }
                Ok(PipelineEvent::BackupFailed(detail)) => {
                    self.last_notice = Some(format!("backup failed: {}", detail));
                }
                Ok(PipelineEvent::PortsChanged(ports)) => self.known_ports = ports,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.feed_alive = false;
                    break;
                }
            }
        }
    }
}

/// Run the dashboard until `q` is pressed or the event feed dies.
pub fn engage_gui(events: Receiver<PipelineEvent>) -> Result<(), GuiError> {
    // setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // create app and run it
    let tick_rate = Duration::from_millis(250);
    let app = App::new(events);
    let res = run_app(&mut terminal, app, tick_rate);

    // restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    res.map_err(GuiError::from)
}

fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    mut app: App,
    tick_rate: Duration,
) -> io::Result<()> {
    let mut last_tick = Instant::now();
    loop {
        terminal.draw(|f| ui(f, &app))?;

        let timeout = tick_rate.saturating_sub(last_tick.elapsed());
        if crossterm::event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if let KeyCode::Char('q') = key.code {
                    return Ok(());
                }
            }
        }
        if last_tick.elapsed() >= tick_rate {
            app.on_tick();
            last_tick = Instant::now();
            if !app.feed_alive {
                return Ok(());
            }
        }
    }
}

fn ui(f: &mut Frame, app: &App) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(4),
            Constraint::Min(7),
            Constraint::Length(3),
        ])
        .split(f.size());
    let top = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(rows[0]);

    let link_style = Style::default().fg(match app.connection {
        ConnectionState::Connected => Color::Green,
        ConnectionState::Stalled => Color::Red,
        ConnectionState::Disconnected => Color::DarkGray,
        _ => Color::Yellow,
    });
    let link = Paragraph::new(app.connection.to_string())
        .style(link_style)
        .block(Block::default().title(" Link ").borders(Borders::ALL));
    f.render_widget(link, top[0]);

    let recorder_style = Style::default().fg(match app.recording {
        RecorderState::Active => Color::Green,
        RecorderState::Paused => Color::Yellow,
        _ => Color::White,
    });
    let recorder = Paragraph::new(app.recording.to_string())
        .style(recorder_style)
        .block(Block::default().title(" Recorder ").borders(Borders::ALL));
    f.render_widget(recorder, top[1]);

    let mut sample_lines = vec![match &app.last_sample {
        Some(sample) => Line::from(format!(
            "vertical {:.3} V    horizontal {:.3} V",
            sample.vertical_volts, sample.horizontal_volts
        )),
        None => Line::from("waiting for data"),
    }];
    if app.connection == ConnectionState::Disconnected && !app.known_ports.is_empty() {
        let names: Vec<String> = app
            .known_ports
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        sample_lines.push(Line::from(format!("devices: {}", names.join(", "))));
    }
    let sample_panel = Paragraph::new(sample_lines).block(
        Block::default()
            .title(" Latest Sample ")
            .borders(Borders::ALL),
    );
    f.render_widget(sample_panel, rows[1]);

    let stats = app.stats.summarize();
    let stats_lines = vec![
        Line::from(format!(
            "rate        {:8.1} samples/s",
            stats.samples_per_sec
        )),
        Line::from(format!(
            "vertical    mean {:.3} V    peak {:.3} V",
            stats.vertical.mean_volts, stats.vertical.peak_volts
        )),
        Line::from(format!(
            "horizontal  mean {:.3} V    peak {:.3} V",
            stats.horizontal.mean_volts, stats.horizontal.peak_volts
        )),
        Line::from(format!("window      {:8} samples", stats.sample_count)),
        Line::from(format!("bad frames  {:8}", app.bad_frames)),
    ];
    let stats_panel = Paragraph::new(stats_lines).block(
        Block::default()
            .title(" Last 10 Seconds ")
            .borders(Borders::ALL),
    );
    f.render_widget(stats_panel, rows[2]);

    let notice = app
        .last_notice
        .clone()
        .unwrap_or_else(|| "q quits".to_string());
    let notice_panel =
        Paragraph::new(notice).block(Block::default().title(" Notices ").borders(Borders::ALL));
    f.render_widget(notice_panel, rows[3]);
}
