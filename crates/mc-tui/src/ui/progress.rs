use std::collections::BTreeMap;

use ratatui::layout::{Constraint, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};
use ratatui::Frame;

use mc_core::models::{FormationOutcome, FormationReport, JoinState, ServiceType};

use crate::app::App;

/// Per-system grid of join states while formation runs, then the summary.
pub fn render(f: &mut Frame, area: Rect, app: &App) {
    if let Some(report) = &app.report {
        let lines: Vec<Line> = summary_lines(report).into_iter().map(Line::from).collect();
        let widget = Paragraph::new(lines).block(
            Block::default()
                .title(" Summary ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(outcome_color(report.outcome))),
        );
        f.render_widget(widget, area);
        return;
    }
    if let Some(failure) = &app.failure {
        let widget = Paragraph::new(Line::from(Span::styled(
            format!(" {failure}"),
            Style::default().fg(Color::Red),
        )))
        .block(Block::default().title(" Failed ").borders(Borders::ALL));
        f.render_widget(widget, area);
        return;
    }
    render_grid(f, area, &app.progress);
}

fn render_grid(
    f: &mut Frame,
    area: Rect,
    progress: &BTreeMap<String, BTreeMap<ServiceType, JoinState>>,
) {
    let mut header = vec![Cell::from("SYSTEM")];
    header.extend(ServiceType::ALL.iter().map(|s| Cell::from(s.as_str().to_uppercase())));

    let rows: Vec<Row> = progress
        .iter()
        .map(|(system, states)| {
            let mut cells = vec![Cell::from(system.clone())];
            cells.extend(ServiceType::ALL.iter().map(|service| match states.get(service) {
                Some(state) => state_cell(state),
                None => Cell::from("-").style(Style::default().fg(Color::DarkGray)),
            }));
            Row::new(cells)
        })
        .collect();

    let widths = [
        Constraint::Fill(2),
        Constraint::Fill(1),
        Constraint::Fill(1),
        Constraint::Fill(1),
        Constraint::Fill(1),
    ];
    let table = Table::new(rows, widths)
        .header(Row::new(header).style(Style::default().add_modifier(Modifier::BOLD)))
        .block(
            Block::default()
                .title(" Forming clusters ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray)),
        );
    f.render_widget(table, area);
}

fn state_cell(state: &JoinState) -> Cell<'static> {
    let color = match state {
        JoinState::Pending => Color::DarkGray,
        JoinState::Joining => Color::Yellow,
        JoinState::Joined => Color::Green,
        JoinState::Failed(_) => Color::Red,
    };
    Cell::from(state_label(state)).style(Style::default().fg(color))
}

pub fn state_label(state: &JoinState) -> String {
    match state {
        JoinState::Pending => "pending".into(),
        JoinState::Joining => "joining".into(),
        JoinState::Joined => "joined".into(),
        JoinState::Failed(_) => "failed".into(),
    }
}

fn outcome_color(outcome: FormationOutcome) -> Color {
    match outcome {
        FormationOutcome::Success => Color::Green,
        FormationOutcome::Degraded => Color::Yellow,
        FormationOutcome::InProgress => Color::DarkGray,
        FormationOutcome::Aborted | FormationOutcome::Cancelled => Color::Red,
    }
}

/// Plain-text summary, shared by the TUI and the non-interactive modes.
pub fn summary_lines(report: &FormationReport) -> Vec<String> {
    let mut lines = Vec::new();
    let headline = match report.outcome {
        FormationOutcome::Success if report.states.is_empty() => {
            "No new systems to add".to_string()
        }
        FormationOutcome::Success => "MicroCloud is ready".to_string(),
        FormationOutcome::Degraded => {
            "MicroCloud is ready with reduced optional services".to_string()
        }
        FormationOutcome::Aborted => "Cluster formation aborted".to_string(),
        FormationOutcome::Cancelled => "Cluster formation cancelled".to_string(),
        FormationOutcome::InProgress => "Cluster formation in progress".to_string(),
    };
    lines.push(headline);

    for (system, states) in &report.states {
        let services: Vec<String> = states
            .iter()
            .map(|(service, state)| format!("{service}={}", state_label(state)))
            .collect();
        lines.push(format!("  {system}: {}", services.join(" ")));
    }

    for exclusion in &report.exclusions {
        lines.push(format!(
            "  excluded {} from {}: {}",
            exclusion.system, exclusion.service, exclusion.reason
        ));
    }

    if let Some(finished) = report.finished_at {
        let elapsed = finished - report.started_at;
        lines.push(format!("  took {:.1}s", elapsed.num_milliseconds() as f64 / 1000.0));
    }
    lines
}
