// Each test binary compiles this module independently and uses a different
// subset of helpers, so unused-function warnings are expected.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use mc_core::models::{CandidateSystem, DiskInfo, NetIfaceInfo, ResourceReport, ServiceType};
use mc_tui::app::App;
use mc_tui::ui;
use ratatui::{backend::TestBackend, Terminal};

/// Render the app to a string using a TestBackend of the given dimensions.
pub fn render_to_string(app: &App, width: u16, height: u16) -> String {
    let mut terminal = Terminal::new(TestBackend::new(width, height)).unwrap();
    terminal.draw(|f| ui::render(f, app)).unwrap();
    terminal.backend().to_string()
}

pub fn ip(index: u8) -> IpAddr {
    IpAddr::from([10, 0, 0, index])
}

/// A peer as discovery reports it, every service installed.
pub fn make_peer(name: &str, index: u8) -> CandidateSystem {
    CandidateSystem::new(
        name.to_string(),
        ip(index),
        ServiceType::ALL.into_iter().collect::<BTreeSet<_>>(),
    )
}

/// A peer with resources attached and every service chosen.
pub fn make_queried(name: &str, index: u8) -> CandidateSystem {
    let mut system = make_peer(name, index);
    for service in ServiceType::ALL {
        system.participate(service);
    }
    system.resources = Some(ResourceReport {
        disks: vec![
            DiskInfo {
                path: "/dev/sdb".into(),
                size: 100 << 30,
                model: "QEMU HARDDISK".into(),
                in_use: false,
            },
            DiskInfo {
                path: "/dev/sdc".into(),
                size: 200 << 30,
                model: "QEMU HARDDISK".into(),
                in_use: false,
            },
        ],
        interfaces: vec![
            NetIfaceInfo {
                name: "eth0".into(),
                up: true,
                addresses: vec![format!("10.0.0.{index}/24").parse().unwrap()],
                in_use: true,
            },
            NetIfaceInfo {
                name: "eth1".into(),
                up: true,
                addresses: vec![],
                in_use: false,
            },
        ],
    });
    system
}

pub fn make_systems(count: u8) -> BTreeMap<String, CandidateSystem> {
    (1..=count)
        .map(|i| {
            let name = format!("micro{i:02}");
            (name.clone(), make_queried(&name, i))
        })
        .collect()
}
