use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::app::{App, Mode};

/// Handle a key event, dispatching based on current mode.
pub fn handle_key(app: &mut App, key: KeyEvent) {
    tracing::debug!(mode = ?app.mode, key = ?key.code, "handle_key");

    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        app.cancel();
        return;
    }

    match &app.mode {
        Mode::Discovery | Mode::LocalDisks | Mode::DistributedDisks | Mode::Uplinks => {
            handle_table(app, key)
        }
        Mode::Finished => {
            if matches!(key.code, KeyCode::Enter | KeyCode::Esc | KeyCode::Char('q')) {
                app.should_quit = true;
            }
        }
        Mode::Waiting(_) | Mode::Forming => {
            if key.code == KeyCode::Esc {
                app.cancel();
            }
        }
    }
}

fn handle_table(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Esc => app.cancel(),
        KeyCode::Enter => app.confirm(),
        KeyCode::Up => app.table.up(),
        KeyCode::Down => app.table.down(),
        KeyCode::Char(' ') => app.table.toggle(),
        KeyCode::Right => app.table.select_all(),
        KeyCode::Left => app.table.select_none(),
        KeyCode::Backspace => app.table.pop_filter(),
        KeyCode::Char(c) => app.table.push_filter(c),
        _ => {}
    }
}
