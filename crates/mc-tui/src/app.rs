use std::collections::{BTreeMap, BTreeSet};

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use ipnet::IpNet;
use tokio::sync::{mpsc, oneshot};

use mc_core::models::{
    CandidateSystem, DiskPurpose, DiskSelection, FormationEvent, FormationReport, JoinState,
    ServiceType, SessionKind,
};
use mc_core::services::discovery::DiscoveryControl;
use mc_core::services::negotiator::usable_disks;
use mc_core::services::{DiskChoices, NetworkChoices, Selection};

use crate::strategy::UiRequest;

/// The active mode determines which table is shown and what confirming does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Peers stream in; the operator picks which ones join.
    Discovery,
    /// At most one disk per system for the local pool.
    LocalDisks,
    /// Any number of disks per system for distributed storage.
    DistributedDisks,
    /// At most one uplink interface per system.
    Uplinks,
    /// Waiting on the session, nothing to select.
    Waiting(String),
    Forming,
    Finished,
}

/// One selectable row. `group` ties rows that compete for a one-per-group
/// choice, usually the system name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub group: String,
    pub key: String,
    pub cells: Vec<String>,
}

/// Filterable multi-select table shared by every selection step.
#[derive(Debug, Clone, Default)]
pub struct SelectionTable {
    pub title: String,
    pub header: Vec<String>,
    pub rows: Vec<TableRow>,
    pub selected: BTreeSet<usize>,
    /// Indices into `rows` that pass the filter, in display order.
    pub visible: Vec<usize>,
    /// Position of the cursor within `visible`.
    pub cursor: usize,
    pub filter: String,
    pub one_per_group: bool,
}

impl SelectionTable {
    pub fn new(title: &str, header: &[&str]) -> Self {
        Self {
            title: title.to_string(),
            header: header.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn one_per_group(mut self) -> Self {
        self.one_per_group = true;
        self
    }

    pub fn push(&mut self, row: TableRow) {
        self.rows.push(row);
        self.apply_filter();
    }

    /// Run fuzzy matching over every row using `filter` as the query.
    pub fn apply_filter(&mut self) {
        let query = self.filter.trim();
        if query.is_empty() {
            self.visible = (0..self.rows.len()).collect();
        } else {
            let matcher = SkimMatcherV2::default();
            let mut scored: Vec<(i64, usize)> = self
                .rows
                .iter()
                .enumerate()
                .filter_map(|(i, row)| {
                    matcher
                        .fuzzy_match(&row.cells.join(" "), query)
                        .map(|score| (score, i))
                })
                .collect();
            scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            self.visible = scored.into_iter().map(|(_, i)| i).collect();
        }
        self.cursor = self.cursor.min(self.visible.len().saturating_sub(1));
    }

    pub fn set_filter(&mut self, filter: &str) {
        self.filter = filter.to_string();
        self.apply_filter();
    }

    pub fn push_filter(&mut self, ch: char) {
        self.filter.push(ch);
        self.apply_filter();
    }

    pub fn pop_filter(&mut self) {
        self.filter.pop();
        self.apply_filter();
    }

    pub fn up(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn down(&mut self) {
        if self.cursor + 1 < self.visible.len() {
            self.cursor += 1;
        }
    }

    pub fn current(&self) -> Option<usize> {
        self.visible.get(self.cursor).copied()
    }

    pub fn toggle(&mut self) {
        let Some(index) = self.current() else {
            return;
        };
        if self.selected.remove(&index) {
            return;
        }
        if self.one_per_group {
            let group = &self.rows[index].group;
            let rivals: Vec<usize> = self
                .selected
                .iter()
                .copied()
                .filter(|&i| &self.rows[i].group == group)
                .collect();
            for rival in rivals {
                self.selected.remove(&rival);
            }
        }
        self.selected.insert(index);
    }

    /// Select every visible row, keeping the first per group when limited.
    pub fn select_all(&mut self) {
        let mut taken: BTreeSet<String> = self
            .selected
            .iter()
            .map(|&i| self.rows[i].group.clone())
            .collect();
        for &index in &self.visible {
            if self.one_per_group && !taken.insert(self.rows[index].group.clone()) {
                continue;
            }
            self.selected.insert(index);
        }
    }

    pub fn select_none(&mut self) {
        for index in &self.visible {
            self.selected.remove(index);
        }
    }

    pub fn is_selected(&self, index: usize) -> bool {
        self.selected.contains(&index)
    }

    pub fn selected_rows(&self) -> impl Iterator<Item = &TableRow> {
        self.selected.iter().map(|&i| &self.rows[i])
    }
}

/// Answer channel of the question currently on screen.
#[derive(Debug)]
pub enum PendingReply {
    Disks {
        systems: BTreeMap<String, CandidateSystem>,
        wipe_allowed: bool,
        reply: oneshot::Sender<Selection<DiskChoices>>,
    },
    Networks {
        subnet: IpNet,
        reply: oneshot::Sender<Selection<NetworkChoices>>,
    },
}

pub struct App {
    pub kind: SessionKind,
    pub mode: Mode,
    pub table: SelectionTable,
    pub discovered: BTreeMap<String, CandidateSystem>,
    /// Local pool picks, held while distributed disks are chosen.
    pub local_disks: BTreeMap<String, String>,
    pub progress: BTreeMap<String, BTreeMap<ServiceType, JoinState>>,
    pub report: Option<FormationReport>,
    pub failure: Option<String>,
    pub status_message: Option<String>,
    pub should_quit: bool,
    pub controls: Option<mpsc::UnboundedSender<DiscoveryControl>>,
    pub pending: Option<PendingReply>,
}

impl App {
    pub fn new(kind: SessionKind) -> Self {
        Self {
            kind,
            mode: Mode::Discovery,
            table: discovery_table(),
            discovered: BTreeMap::new(),
            local_disks: BTreeMap::new(),
            progress: BTreeMap::new(),
            report: None,
            failure: None,
            status_message: None,
            should_quit: false,
            controls: None,
            pending: None,
        }
    }

    pub fn with_controls(mut self, controls: mpsc::UnboundedSender<DiscoveryControl>) -> Self {
        self.controls = Some(controls);
        self
    }

    pub fn set_status(&mut self, message: impl Into<String>) {
        self.status_message = Some(message.into());
    }

    pub fn record_discovered(&mut self, system: CandidateSystem) {
        if self.discovered.contains_key(&system.name) {
            return;
        }
        let services: Vec<&str> = system.installed.iter().map(|s| s.as_str()).collect();
        self.table.push(TableRow {
            group: system.name.clone(),
            key: system.name.clone(),
            cells: vec![
                system.name.clone(),
                system.address.to_string(),
                services.join(","),
            ],
        });
        self.discovered.insert(system.name.clone(), system);
    }

    /// Ask discovery to fail if more than `count` peers show up.
    pub fn expect(&mut self, count: usize) {
        if let Some(controls) = &self.controls {
            let _ = controls.send(DiscoveryControl::Expect(count));
        }
    }

    pub fn present(&mut self, request: UiRequest) {
        match request {
            UiRequest::Disks {
                systems,
                wipe_allowed,
                reply,
            } => {
                self.table = local_disk_table(&systems, wipe_allowed);
                self.local_disks.clear();
                self.mode = Mode::LocalDisks;
                self.pending = Some(PendingReply::Disks {
                    systems,
                    wipe_allowed,
                    reply,
                });
            }
            UiRequest::Networks {
                systems,
                subnet,
                reply,
            } => {
                self.table = uplink_table(&systems, subnet);
                self.mode = Mode::Uplinks;
                self.pending = Some(PendingReply::Networks { subnet, reply });
            }
        }
    }

    pub fn record_progress(&mut self, event: FormationEvent) {
        if self.mode != Mode::Finished {
            self.mode = Mode::Forming;
        }
        self.progress
            .entry(event.system)
            .or_default()
            .insert(event.service, event.state);
    }

    pub fn finish(&mut self, result: Result<FormationReport, String>) {
        match result {
            Ok(report) => {
                self.progress = report.states.clone();
                self.report = Some(report);
            }
            Err(e) => {
                self.set_status(format!("Error: {e}"));
                self.failure = Some(e);
            }
        }
        self.mode = Mode::Finished;
    }

    /// Commit the current table as the operator's answer.
    pub fn confirm(&mut self) {
        match self.mode {
            Mode::Discovery => {
                let names: BTreeSet<String> =
                    self.table.selected_rows().map(|r| r.key.clone()).collect();
                tracing::info!(count = names.len(), "peers_confirmed");
                if let Some(controls) = &self.controls {
                    let _ = controls.send(DiscoveryControl::Confirm(names));
                }
                self.mode = Mode::Waiting("Querying resources...".into());
            }
            Mode::LocalDisks => {
                self.local_disks = self
                    .table
                    .selected_rows()
                    .map(|r| (r.group.clone(), r.key.clone()))
                    .collect();
                if let Some(PendingReply::Disks {
                    systems,
                    wipe_allowed,
                    ..
                }) = &self.pending
                {
                    self.table =
                        distributed_disk_table(systems, *wipe_allowed, &self.local_disks);
                }
                self.mode = Mode::DistributedDisks;
            }
            Mode::DistributedDisks => {
                let Some(PendingReply::Disks {
                    systems,
                    wipe_allowed,
                    reply,
                }) = self.pending.take()
                else {
                    return;
                };
                let choices = self.disk_choices(&systems, wipe_allowed);
                let _ = reply.send(Selection::Chosen(choices));
                self.mode = Mode::Waiting("Validating selection...".into());
            }
            Mode::Uplinks => {
                let Some(PendingReply::Networks { reply, .. }) = self.pending.take() else {
                    return;
                };
                let uplinks = self
                    .table
                    .selected_rows()
                    .map(|r| (r.group.clone(), r.key.clone()))
                    .collect();
                let _ = reply.send(Selection::Chosen(NetworkChoices {
                    uplinks,
                    ..Default::default()
                }));
                self.mode = Mode::Waiting("Forming clusters...".into());
            }
            Mode::Finished => self.should_quit = true,
            Mode::Waiting(_) | Mode::Forming => {}
        }
    }

    /// Abandon the session from any step.
    pub fn cancel(&mut self) {
        match self.pending.take() {
            Some(PendingReply::Disks { reply, .. }) => {
                let _ = reply.send(Selection::Cancelled);
            }
            Some(PendingReply::Networks { reply, .. }) => {
                let _ = reply.send(Selection::Cancelled);
            }
            None => {
                if self.mode == Mode::Discovery {
                    if let Some(controls) = &self.controls {
                        let _ = controls.send(DiscoveryControl::Cancel);
                    }
                }
            }
        }
        self.should_quit = true;
    }

    fn disk_choices(
        &self,
        systems: &BTreeMap<String, CandidateSystem>,
        wipe_allowed: bool,
    ) -> DiskChoices {
        let mut choices: DiskChoices = systems.keys().map(|n| (n.clone(), Vec::new())).collect();
        let in_use = |system: &str, path: &str| {
            systems
                .get(system)
                .and_then(|s| s.resources.as_ref())
                .and_then(|r| r.disk(path))
                .is_some_and(|d| d.in_use)
        };
        for (system, path) in &self.local_disks {
            choices.entry(system.clone()).or_default().push(DiskSelection {
                path: path.clone(),
                purpose: DiskPurpose::Local,
                wipe: wipe_allowed && in_use(system, path),
            });
        }
        for row in self.table.selected_rows() {
            choices.entry(row.group.clone()).or_default().push(DiskSelection {
                path: row.key.clone(),
                purpose: DiskPurpose::Distributed,
                wipe: wipe_allowed && in_use(&row.group, &row.key),
            });
        }
        choices
    }
}

pub fn discovery_table() -> SelectionTable {
    SelectionTable::new("Select systems to join the cluster", &["NAME", "ADDRESS", "SERVICES"])
}

fn disk_rows(
    systems: &BTreeMap<String, CandidateSystem>,
    wipe_allowed: bool,
    skip: &BTreeMap<String, String>,
) -> Vec<TableRow> {
    let mut rows = Vec::new();
    for system in systems.values() {
        let Some(report) = system.resources.as_ref() else {
            continue;
        };
        for disk in usable_disks(report, wipe_allowed) {
            if skip.get(&system.name) == Some(&disk.path) {
                continue;
            }
            rows.push(TableRow {
                group: system.name.clone(),
                key: disk.path.clone(),
                cells: vec![
                    system.name.clone(),
                    disk.path.clone(),
                    human_size(disk.size),
                    disk.model.clone(),
                    if disk.in_use { "wipe".into() } else { String::new() },
                ],
            });
        }
    }
    rows
}

fn local_disk_table(
    systems: &BTreeMap<String, CandidateSystem>,
    wipe_allowed: bool,
) -> SelectionTable {
    let mut table = SelectionTable::new(
        "Select one disk per system for local storage",
        &["LOCATION", "PATH", "SIZE", "MODEL", ""],
    )
    .one_per_group();
    table.rows = disk_rows(systems, wipe_allowed, &BTreeMap::new());
    table.apply_filter();
    table
}

fn distributed_disk_table(
    systems: &BTreeMap<String, CandidateSystem>,
    wipe_allowed: bool,
    local: &BTreeMap<String, String>,
) -> SelectionTable {
    let mut table = SelectionTable::new(
        "Select disks for distributed storage",
        &["LOCATION", "PATH", "SIZE", "MODEL", ""],
    );
    let storage_members: BTreeMap<String, CandidateSystem> = systems
        .iter()
        .filter(|(_, s)| s.participates(ServiceType::Storage))
        .map(|(n, s)| (n.clone(), s.clone()))
        .collect();
    table.rows = disk_rows(&storage_members, wipe_allowed, local);
    table.apply_filter();
    table
}

fn uplink_table(systems: &BTreeMap<String, CandidateSystem>, subnet: IpNet) -> SelectionTable {
    let mut table = SelectionTable::new(
        "Select an uplink interface per system",
        &["LOCATION", "IFACE", "INTERNAL"],
    )
    .one_per_group();
    for system in systems.values() {
        if !system.participates(ServiceType::Network) {
            continue;
        }
        let Some(report) = system.resources.as_ref() else {
            continue;
        };
        let internal = report
            .interfaces
            .iter()
            .find_map(|i| i.address_in(&subnet))
            .map(|a| a.to_string())
            .unwrap_or_default();
        for iface in report.interfaces.iter().filter(|i| i.is_uplink_candidate()) {
            table.rows.push(TableRow {
                group: system.name.clone(),
                key: iface.name.clone(),
                cells: vec![system.name.clone(), iface.name.clone(), internal.clone()],
            });
        }
    }
    table.apply_filter();
    table
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}
