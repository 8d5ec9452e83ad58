use ratatui::layout::{Constraint, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Row, Table, TableState};
use ratatui::Frame;

use crate::app::SelectionTable;

pub fn render(f: &mut Frame, area: Rect, table: &SelectionTable) {
    let mut header_cells = vec![String::new()];
    header_cells.extend(table.header.iter().cloned());
    let header = Row::new(header_cells).style(
        Style::default()
            .fg(Color::DarkGray)
            .add_modifier(Modifier::BOLD),
    );

    let rows: Vec<Row> = table
        .visible
        .iter()
        .map(|&index| {
            let mark = if table.is_selected(index) { "[x]" } else { "[ ]" };
            let mut cells = vec![mark.to_string()];
            cells.extend(table.rows[index].cells.iter().cloned());
            Row::new(cells)
        })
        .collect();

    let columns = table.header.len();
    let mut widths = vec![Constraint::Length(3)];
    widths.extend((0..columns).map(|_| Constraint::Fill(1)));

    let widget = Table::new(rows, widths)
        .header(header)
        .block(
            Block::default()
                .title(format!(" {} ", table.title))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray)),
        )
        .row_highlight_style(
            Style::default()
                .bg(Color::Rgb(0x1A, 0x3A, 0x5C))
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");

    let mut state = TableState::default();
    if !table.visible.is_empty() {
        state.select(Some(table.cursor));
    }

    f.render_stateful_widget(widget, area, &mut state);
}

pub fn render_filter(f: &mut Frame, area: Rect, table: &SelectionTable) {
    let line = if table.filter.is_empty() {
        Line::from(Span::styled(
            " Type to filter",
            Style::default().fg(Color::DarkGray),
        ))
    } else {
        Line::from(vec![
            Span::styled(" Filter: ", Style::default().fg(Color::DarkGray)),
            Span::styled(table.filter.clone(), Style::default().fg(Color::White)),
        ])
    };
    f.render_widget(Paragraph::new(line), area);
}
