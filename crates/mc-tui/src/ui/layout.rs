use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::Paragraph;
use ratatui::Frame;

use mc_core::models::SessionKind;

/// Main vertical layout: [title bar] [filter] [content] [status bar]
pub fn main_layout(area: Rect) -> Vec<Rect> {
    Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1), // title
            Constraint::Length(1), // filter
            Constraint::Min(5),    // content
            Constraint::Length(2), // status bar
        ])
        .split(area)
        .to_vec()
}

pub fn render_title(f: &mut Frame, area: Rect, kind: SessionKind, step: &str) {
    let action = match kind {
        SessionKind::Init => "init",
        SessionKind::Add => "add",
    };
    let title = Paragraph::new(Line::from(vec![
        Span::styled(" MicroCloud ", Style::default().fg(Color::Yellow)),
        Span::styled(format!("({action}) "), Style::default().fg(Color::DarkGray)),
        Span::styled(step.to_string(), Style::default().fg(Color::White)),
    ]));
    f.render_widget(title, area);
}
