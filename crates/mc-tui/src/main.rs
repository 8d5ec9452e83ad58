use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{bail, eyre, WrapErr};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ipnet::IpNet;
use ratatui::backend::{CrosstermBackend, TestBackend};
use ratatui::Terminal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mc_core::error::BootstrapError;
use mc_core::models::{
    Advertisement, FormationReport, InputMode, ServiceType, SessionConfig, SessionKind,
};
use mc_core::services::{
    preseed, AutomaticStrategy, Beacon, BootstrapSession, BroadcastListener, DiscoveryUpdate,
    HandlerSet, HttpServiceClient, PreseedStrategy, SelectionStrategy, ServiceHandle, Timeouts,
    DISCOVERY_PORT,
};

use mc_tui::app::{App, Mode};
use mc_tui::console::{self, ConsoleDriver};
use mc_tui::event::{spawn_forward, spawn_input_task, spawn_tick_task, AppEvent};
use mc_tui::keys;
use mc_tui::strategy::InteractiveStrategy;
use mc_tui::ui;
use mc_tui::ui::progress::summary_lines;

const USAGE: &str = "usage: microcloud <init|add|join> [--auto] [--wipe] [--preseed <file>] \
[--lookup-timeout <secs>] [--state-dir <dir>] [--address <ip>] [--subnet <cidr>] \
[--interface <name>] [--skip <storage|network>] [--debug] [--json]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Init,
    Add,
    Join,
}

#[derive(Debug)]
struct Options {
    command: Command,
    auto: bool,
    wipe: bool,
    preseed: Option<PathBuf>,
    lookup_timeout: Option<Duration>,
    state_dir: PathBuf,
    address: Option<IpAddr>,
    subnet: Option<IpNet>,
    interface: Option<String>,
    /// Optional services the operator declined.
    skip: BTreeSet<ServiceType>,
    debug: bool,
    json: bool,
}

fn parse_args(args: &[String]) -> color_eyre::Result<Options> {
    let command = match args.get(1).map(String::as_str) {
        Some("init") => Command::Init,
        Some("add") => Command::Add,
        Some("join") => Command::Join,
        _ => bail!(USAGE),
    };

    let mut options = Options {
        command,
        auto: false,
        wipe: false,
        preseed: None,
        lookup_timeout: None,
        state_dir: PathBuf::from("."),
        address: None,
        subnet: None,
        interface: None,
        skip: BTreeSet::new(),
        debug: false,
        json: false,
    };

    let mut rest = args.iter().skip(2);
    while let Some(flag) = rest.next() {
        let mut value = |name: &str| {
            rest.next()
                .cloned()
                .ok_or_else(|| eyre!("{name} needs a value\n{USAGE}"))
        };
        match flag.as_str() {
            "--auto" => options.auto = true,
            "--wipe" => options.wipe = true,
            "--debug" => options.debug = true,
            "--json" => options.json = true,
            "--preseed" => options.preseed = Some(PathBuf::from(value(flag.as_str())?)),
            "--state-dir" => options.state_dir = PathBuf::from(value(flag.as_str())?),
            "--interface" => options.interface = Some(value(flag.as_str())?),
            "--lookup-timeout" => {
                let secs: u64 = value(flag.as_str())?
                    .parse()
                    .wrap_err("--lookup-timeout takes whole seconds")?;
                // Zero keeps the mode default.
                options.lookup_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            "--skip" => {
                let service: ServiceType = value(flag.as_str())?
                    .parse()
                    .map_err(|e: String| eyre!("{e}\n{USAGE}"))?;
                if service.is_mandatory() {
                    bail!("{service} is required and cannot be skipped");
                }
                options.skip.insert(service);
            }
            "--address" => {
                options.address = Some(value(flag.as_str())?.parse().wrap_err("invalid --address")?)
            }
            "--subnet" => {
                options.subnet = Some(value(flag.as_str())?.parse().wrap_err("invalid --subnet")?)
            }
            other => bail!("unknown flag '{other}'\n{USAGE}"),
        }
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    ensure_root()?;
    std::fs::create_dir_all(&options.state_dir)?;
    let _guard = setup_logging(&options.state_dir, options.debug);
    tracing::info!(command = ?options.command, "microcloud_started");

    let preseed = match &options.preseed {
        Some(path) => Some(preseed::load(path)?),
        None => None,
    };

    let mut subnet = options.subnet;
    if let Some(p) = &preseed {
        subnet = subnet.or(p.lookup_subnet);
    }
    let address = match options.address {
        Some(address) => address,
        None => infer_address(subnet)?,
    };
    let subnet = subnet.unwrap_or_else(|| default_subnet(address));
    let name = local_name();

    let timeouts = Timeouts::default();
    let handlers =
        HandlerSet::resolve(&name, address, service_handles(address, timeouts)?, &options.skip)
            .await?;

    let kind = match options.command {
        Command::Join => return run_beacon(&name, address, subnet, &handlers).await,
        Command::Init => SessionKind::Init,
        Command::Add => SessionKind::Add,
    };

    let mode = if preseed.is_some() {
        InputMode::Preseed
    } else if options.auto {
        InputMode::Automatic
    } else {
        InputMode::Interactive
    };

    let mut config = SessionConfig::new(kind, mode, &name, address, subnet);
    config.interface = options.interface.clone().unwrap_or_default();
    config.lookup_timeout = options.lookup_timeout;
    config.wipe_allowed = options.wipe;
    if let Some(p) = &preseed {
        preseed::apply(p, &mut config);
    }

    let cancel = CancellationToken::new();
    let result = match (mode, preseed) {
        (InputMode::Interactive, _) => run_interactive(config, handlers, cancel).await?,
        (_, Some(p)) => {
            run_unattended(config, handlers, cancel, &mut PreseedStrategy::new(p)).await
        }
        (_, None) => run_unattended(config, handlers, cancel, &mut AutomaticStrategy).await,
    };

    finish(result, options.json)
}

#[cfg(unix)]
fn ensure_root() -> color_eyre::Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } != 0 {
        bail!("microcloud must be run as root");
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_root() -> color_eyre::Result<()> {
    Ok(())
}

/// Configure file-based tracing to `microcloud-debug.log` in the state directory.
/// Returns the guard that must be held alive for the duration of the program.
fn setup_logging(state_dir: &Path, debug: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::never(state_dir, "microcloud-debug.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let default_level = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_ansi(false)
        .init();

    guard
}

fn local_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Pick the source address the kernel would use to reach the subnet.
fn infer_address(subnet: Option<IpNet>) -> color_eyre::Result<IpAddr> {
    let Some(subnet) = subnet else {
        bail!("either --address or --subnet is required");
    };
    let probe = subnet.hosts().next().unwrap_or(subnet.addr());
    let bind: SocketAddr = match probe {
        IpAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
        IpAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind)?;
    socket
        .connect(SocketAddr::new(probe, DISCOVERY_PORT))
        .wrap_err_with(|| format!("no route to {subnet}"))?;
    let address = socket.local_addr()?.ip();
    if !subnet.contains(&address) {
        bail!("no local address on {subnet}, pass --address");
    }
    Ok(address)
}

fn default_subnet(address: IpAddr) -> IpNet {
    let prefix = if address.is_ipv4() { 24 } else { 64 };
    IpNet::new(address, prefix)
        .map(|net| net.trunc())
        .unwrap_or_else(|_| IpNet::from(address))
}

fn service_handles(address: IpAddr, timeouts: Timeouts) -> color_eyre::Result<Vec<ServiceHandle>> {
    ServiceType::ALL
        .into_iter()
        .map(|service| {
            let client = HttpServiceClient::new(service, timeouts.call)?;
            let base = format!("https://{}", SocketAddr::new(address, service.default_port()));
            Ok(ServiceHandle::new(&base, timeouts, Arc::new(client)))
        })
        .collect()
}

/// Advertise this machine until interrupted so an `init` or `add` elsewhere
/// can find it.
async fn run_beacon(
    name: &str,
    address: IpAddr,
    subnet: IpNet,
    handlers: &HandlerSet,
) -> color_eyre::Result<()> {
    let advertisement = Advertisement {
        name: name.to_string(),
        address,
        version: env!("CARGO_PKG_VERSION").to_string(),
        services: handlers.services().collect(),
    };
    let beacon = Beacon::new(advertisement, subnet, DISCOVERY_PORT);
    println!("Advertising {name} ({address}) to {}, press Ctrl-C to stop", beacon.target());

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());
    beacon.run(cancel).await?;
    Ok(())
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt_received");
            cancel.cancel();
        }
    });
}

/// Automatic and preseed sessions: no UI, progress printed as it happens.
async fn run_unattended(
    config: SessionConfig,
    handlers: HandlerSet,
    cancel: CancellationToken,
    strategy: &mut dyn SelectionStrategy,
) -> Result<FormationReport, BootstrapError> {
    spawn_ctrl_c(cancel.clone());
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let session = BootstrapSession::new(config, handlers, cancel).with_progress(progress_tx);

    let printer = tokio::spawn(async move {
        let mut rx = progress_rx;
        while let Some(event) = rx.recv().await {
            println!(
                "{} {}: {}",
                event.system,
                event.service,
                ui::progress::state_label(&event.state)
            );
        }
    });

    let mut source = BroadcastListener::default();
    let result = session.run(&mut source, strategy).await;
    drop(session);
    let _ = printer.await;
    result
}

/// Interactive session: the session runs in a task, the UI loop answers its
/// questions.
async fn run_interactive(
    config: SessionConfig,
    handlers: HandlerSet,
    cancel: CancellationToken,
) -> color_eyre::Result<Result<FormationReport, BootstrapError>> {
    let kind = config.kind;
    let (strategy, channels) = InteractiveStrategy::new();
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let session =
        BootstrapSession::new(config, handlers, cancel.clone()).with_progress(progress_tx);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<AppEvent>();
    let _discovery = spawn_forward(channels.updates, event_tx.clone(), AppEvent::Discovery);
    let _requests = spawn_forward(channels.requests, event_tx.clone(), AppEvent::Request);
    let _progress = spawn_forward(progress_rx, event_tx.clone(), AppEvent::Progress);
    let _tick_task = spawn_tick_task(event_tx.clone());

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let finished_tx = event_tx.clone();
    let session_task = tokio::spawn(async move {
        let mut strategy = strategy;
        let mut source = BroadcastListener::default();
        let result = session.run(&mut source, &mut strategy).await;
        let summary = match &result {
            Ok(report) => Ok(report.clone()),
            Err(e) => Err(e.to_string()),
        };
        let _ = finished_tx.send(AppEvent::Finished(summary));
        let _ = done_tx.send(result);
    });

    let mut app = App::new(kind).with_controls(channels.controls);

    if std::env::var("TEST_CONSOLE").as_deref() == Ok("1") {
        let _stdin = console::spawn_stdin_task(event_tx.clone());
        event_loop(None, &mut app, &mut event_rx, Some(ConsoleDriver::new())).await?;
    } else {
        let _input_task = spawn_input_task(event_tx.clone());
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

        let outcome = event_loop(Some(&mut terminal), &mut app, &mut event_rx, None).await;

        // Restore terminal
        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;
        outcome?;
    }

    cancel.cancel();
    let result = match done_rx.await {
        Ok(result) => result,
        Err(_) => Err(BootstrapError::Cancelled),
    };
    let _ = session_task.await;
    Ok(result)
}

/// Draw, then process at most one event. In console mode frames are only
/// printed when the screen changes step, and the loop ends with the session.
async fn event_loop(
    mut terminal: Option<&mut Terminal<CrosstermBackend<io::Stdout>>>,
    app: &mut App,
    event_rx: &mut mpsc::UnboundedReceiver<AppEvent>,
    mut console: Option<ConsoleDriver>,
) -> color_eyre::Result<()> {
    let mut last_mode: Option<Mode> = None;
    loop {
        if let Some(terminal) = terminal.as_mut() {
            terminal.draw(|f| ui::render(f, app))?;
        }

        if let Ok(event) = event_rx.try_recv() {
            process_event(app, event, console.as_mut());
        } else {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if let Some(driver) = console.as_mut() {
            driver.drain(app);
            if last_mode.as_ref() != Some(&app.mode) {
                last_mode = Some(app.mode.clone());
                if matches!(
                    app.mode,
                    Mode::Discovery | Mode::LocalDisks | Mode::DistributedDisks | Mode::Uplinks
                ) {
                    tracing::debug!(mode = ?app.mode, "console_step");
                    screenshot(app)?;
                }
            }
            if app.mode == Mode::Finished {
                break;
            }
        }

        if app.should_quit {
            break;
        }
    }
    Ok(())
}

/// Render the current app state to a TestBackend and dump frame text to stdout.
fn screenshot(app: &App) -> color_eyre::Result<()> {
    let mut terminal = Terminal::new(TestBackend::new(120, 40))?;
    terminal.draw(|f| ui::render(f, app))?;
    let buf = terminal.backend().buffer();
    for y in 0..buf.area.height {
        let mut line = String::new();
        for x in 0..buf.area.width {
            line.push_str(buf[(x, y)].symbol());
        }
        println!("{}", line.trim_end());
    }
    Ok(())
}

/// Process a single AppEvent, updating app state accordingly.
fn process_event(app: &mut App, event: AppEvent, console: Option<&mut ConsoleDriver>) {
    match event {
        AppEvent::Key(key) => {
            if key.kind == crossterm::event::KeyEventKind::Press {
                keys::handle_key(app, key);
            }
        }
        AppEvent::Tick => {}
        AppEvent::Discovery(DiscoveryUpdate::Found(system)) => app.record_discovered(system),
        AppEvent::Request(request) => app.present(request),
        AppEvent::Progress(event) => app.record_progress(event),
        AppEvent::Finished(result) => app.finish(result),
        AppEvent::Console(instruction) => {
            if let Some(driver) = console {
                driver.announce(app, &instruction);
                driver.push(instruction);
            }
        }
    }
}

fn finish(result: Result<FormationReport, BootstrapError>, json: bool) -> color_eyre::Result<()> {
    let report = match &result {
        Ok(report) => Some(report),
        Err(e) => e.report(),
    };
    if let Some(report) = report {
        if json {
            println!("{}", serde_json::to_string_pretty(report)?);
        } else {
            for line in summary_lines(report) {
                println!("{line}");
            }
        }
    }
    result.map(|_| ()).map_err(|e| eyre!(e))
}
