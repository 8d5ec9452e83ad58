use ratatui::layout::Rect;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::Paragraph;
use ratatui::Frame;

use crate::app::{App, Mode};

pub fn render(f: &mut Frame, area: Rect, app: &App) {
    // First line: status message or blank
    let status_line = if let Some(ref msg) = app.status_message {
        let color = if msg.starts_with("Error") || msg.contains("failed") {
            Color::Red
        } else {
            Color::Green
        };
        Line::from(Span::styled(format!(" {msg}"), Style::default().fg(color)))
    } else if let Mode::Waiting(msg) = &app.mode {
        Line::from(Span::styled(format!(" {msg}"), Style::default().fg(Color::Yellow)))
    } else {
        Line::from("")
    };

    // Second line: context-sensitive hotkey hints
    let hints = match &app.mode {
        Mode::Discovery | Mode::LocalDisks | Mode::DistributedDisks | Mode::Uplinks => {
            Line::from(vec![
                hint("Space", "toggle"),
                Span::raw(" "),
                hint("→", "all"),
                Span::raw(" "),
                hint("←", "none"),
                Span::raw(" "),
                hint("Enter", "confirm"),
                Span::raw(" "),
                hint("Esc", "cancel"),
            ])
        }
        Mode::Waiting(_) | Mode::Forming => Line::from(vec![hint("Esc", "cancel")]),
        Mode::Finished => Line::from(vec![hint("Enter", "exit")]),
    };

    let widget = Paragraph::new(vec![status_line, hints]);
    f.render_widget(widget, area);
}

fn hint(key: &str, label: &str) -> Span<'static> {
    Span::styled(
        format!("[{key}]{label}"),
        Style::default()
            .fg(Color::DarkGray)
            .add_modifier(Modifier::BOLD),
    )
}
