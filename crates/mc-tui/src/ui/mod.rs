pub mod layout;
pub mod progress;
pub mod status_bar;
pub mod table;

use ratatui::Frame;

use crate::app::{App, Mode};

/// Top-level render dispatch.
pub fn render(f: &mut Frame, app: &App) {
    let chunks = layout::main_layout(f.area());

    let step = match &app.mode {
        Mode::Discovery => "Scanning for systems",
        Mode::LocalDisks => "Local storage",
        Mode::DistributedDisks => "Distributed storage",
        Mode::Uplinks => "Uplink network",
        Mode::Waiting(_) => "Working",
        Mode::Forming => "Forming clusters",
        Mode::Finished => "Done",
    };
    layout::render_title(f, chunks[0], app.kind, step);

    match &app.mode {
        Mode::Discovery | Mode::LocalDisks | Mode::DistributedDisks | Mode::Uplinks => {
            table::render_filter(f, chunks[1], &app.table);
            table::render(f, chunks[2], &app.table);
        }
        Mode::Waiting(_) | Mode::Forming | Mode::Finished => {
            progress::render(f, chunks[2], app);
        }
    }

    status_bar::render(f, chunks[3], app);
}
