use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use regex::Regex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{BootstrapError, Result};
use crate::models::{
    Advertisement, CandidateSystem, DiscoverySession, ExpectPolicy, Reachability, ServiceType,
};

use super::handler::HandlerSet;

pub const DISCOVERY_PORT: u16 = 9444;

static HOSTNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$").unwrap());

/// Sent to the selection front end while discovery runs.
#[derive(Debug, Clone)]
pub enum DiscoveryUpdate {
    Found(CandidateSystem),
}

/// Operator decisions fed back into a running discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryControl {
    /// Stop now and keep only these peers.
    Confirm(BTreeSet<String>),
    /// Fail if more than this many peers show up before confirmation.
    Expect(usize),
    Cancel,
}

/// The discovery end of an interactive selection front end.
#[derive(Debug)]
pub struct DiscoveryLink {
    pub updates: mpsc::UnboundedSender<DiscoveryUpdate>,
    pub controls: mpsc::UnboundedReceiver<DiscoveryControl>,
}

/// Anything that can deliver peer advertisements.
#[async_trait]
pub trait AdvertisementSource: Send {
    /// Start listening. Advertisements flow until the receiver is dropped.
    async fn listen(
        &mut self,
        session: &DiscoverySession,
    ) -> Result<mpsc::UnboundedReceiver<Advertisement>>;
}

/// In-process source fed through a channel.
pub struct ChannelSource {
    rx: Option<mpsc::UnboundedReceiver<Advertisement>>,
}

impl ChannelSource {
    pub fn new() -> (mpsc::UnboundedSender<Advertisement>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx: Some(rx) })
    }
}

#[async_trait]
impl AdvertisementSource for ChannelSource {
    async fn listen(
        &mut self,
        _session: &DiscoverySession,
    ) -> Result<mpsc::UnboundedReceiver<Advertisement>> {
        self.rx
            .take()
            .ok_or_else(|| BootstrapError::Config("advertisement channel already consumed".into()))
    }
}

/// Listens for UDP broadcast advertisements on the discovery subnet.
pub struct BroadcastListener {
    port: u16,
}

impl BroadcastListener {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Default for BroadcastListener {
    fn default() -> Self {
        Self::new(DISCOVERY_PORT)
    }
}

#[async_trait]
impl AdvertisementSource for BroadcastListener {
    async fn listen(
        &mut self,
        session: &DiscoverySession,
    ) -> Result<mpsc::UnboundedReceiver<Advertisement>> {
        let unusable = |reason: String| BootstrapError::DiscoveryInterface {
            interface: session.interface.clone(),
            reason,
        };

        if !session.interface.is_empty() {
            let sysfs = format!("/sys/class/net/{}", session.interface);
            tokio::fs::metadata(&sysfs)
                .await
                .map_err(|e| unusable(format!("interface not found: {e}")))?;
        }

        let unspecified = match session.subnet {
            IpNet::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpNet::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(unspecified, self.port))
            .await
            .map_err(|e| unusable(format!("failed to bind port {}: {e}", self.port)))?;

        tracing::info!(
            interface = %session.interface,
            subnet = %session.subnet,
            port = self.port,
            "discovery_listening"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let subnet = session.subnet;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, from)) => {
                            if !subnet.contains(&from.ip()) {
                                tracing::debug!(from = %from, "advertisement_outside_subnet");
                                continue;
                            }
                            match serde_json::from_slice::<Advertisement>(&buf[..len]) {
                                Ok(ad) => {
                                    if tx.send(ad).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    tracing::debug!(from = %from, error = %e, "malformed_advertisement")
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "discovery_socket_failed");
                            break;
                        }
                    },
                }
            }
        });

        Ok(rx)
    }
}

/// Periodically broadcasts this machine's advertisement until cancelled.
pub struct Beacon {
    advertisement: Advertisement,
    target: SocketAddr,
    interval: Duration,
}

impl Beacon {
    pub fn new(advertisement: Advertisement, subnet: IpNet, port: u16) -> Self {
        let target_ip = match subnet {
            IpNet::V4(net) => IpAddr::V4(net.broadcast()),
            // All-nodes link-local multicast.
            IpNet::V6(_) => IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1)),
        };
        Self {
            advertisement,
            target: SocketAddr::new(target_ip, port),
            interval: Duration::from_secs(1),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let unspecified = match self.target {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
        socket.set_broadcast(true)?;
        let payload = serde_json::to_vec(&self.advertisement)?;

        tracing::info!(
            name = %self.advertisement.name,
            target = %self.target,
            "beacon_started"
        );

        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = socket.send_to(&payload, self.target).await {
                        tracing::warn!(error = %e, "beacon_send_failed");
                    }
                }
            }
        }

        tracing::info!(name = %self.advertisement.name, "beacon_stopped");
        Ok(())
    }
}

/// Collect candidate peers until the deadline, an operator confirmation, or
/// the expect policy is satisfied.
///
/// Without a `link` the run is unattended and whatever was found by the
/// deadline is returned; an empty map is a valid answer. With a `link` every
/// admitted peer is forwarded as a [`DiscoveryUpdate`] and the operator ends
/// the run through [`DiscoveryControl`].
pub async fn discover<S>(
    handlers: &HandlerSet,
    session: &DiscoverySession,
    source: &mut S,
    mut link: Option<DiscoveryLink>,
) -> Result<BTreeMap<String, CandidateSystem>>
where
    S: AdvertisementSource + ?Sized,
{
    let mut advertisements = source.listen(session).await?;
    let mut expect = session.expect.clone();
    let mut found: BTreeMap<String, CandidateSystem> = BTreeMap::new();
    let mut source_open = true;

    let deadline = tokio::time::Instant::now() + session.timeout;
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    tracing::info!(
        timeout_ms = session.timeout.as_millis() as u64,
        interactive = link.is_some(),
        "discovery_started"
    );

    loop {
        tokio::select! {
            biased;

            control = next_control(&mut link) => match control {
                Some(DiscoveryControl::Confirm(selected)) => {
                    for name in selected.iter().filter(|n| !found.contains_key(*n)) {
                        tracing::warn!(system = %name, "confirmed_unknown_system");
                    }
                    found.retain(|name, _| selected.contains(name));
                    tracing::info!(count = found.len(), "discovery_confirmed");
                    return Ok(confirm(found));
                }
                Some(DiscoveryControl::Expect(count)) => {
                    expect = ExpectPolicy::Exactly(count);
                    check_expect(&expect, found.len())?;
                }
                Some(DiscoveryControl::Cancel) | None => {
                    tracing::info!("discovery_cancelled");
                    return Err(BootstrapError::Cancelled);
                }
            },

            advertisement = advertisements.recv(), if source_open => match advertisement {
                Some(ad) => {
                    let Some(system) = admit(handlers, session, &expect, &found, ad) else {
                        continue;
                    };
                    tracing::info!(
                        system = %system.name,
                        address = %system.address,
                        "system_discovered"
                    );
                    if let Some(link) = link.as_ref() {
                        let _ = link.updates.send(DiscoveryUpdate::Found(system.clone()));
                    }
                    found.insert(system.name.clone(), system);
                    check_expect(&expect, found.len())?;
                    if link.is_none() && expect_satisfied(&expect, found.len()) {
                        break;
                    }
                }
                None => {
                    tracing::debug!("advertisement_source_closed");
                    source_open = false;
                }
            },

            _ = &mut sleep => {
                tracing::info!(count = found.len(), "discovery_deadline_reached");
                break;
            }
        }
    }

    if let ExpectPolicy::Names(names) = &expect {
        let missing: Vec<String> = names
            .iter()
            .filter(|n| !found.contains_key(*n))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(BootstrapError::MissingPeers(missing));
        }
    }

    Ok(confirm(found))
}

async fn next_control(link: &mut Option<DiscoveryLink>) -> Option<DiscoveryControl> {
    match link {
        Some(link) => link.controls.recv().await,
        None => std::future::pending().await,
    }
}

fn confirm(mut found: BTreeMap<String, CandidateSystem>) -> BTreeMap<String, CandidateSystem> {
    for system in found.values_mut() {
        system.reachability = Reachability::Confirmed;
    }
    found
}

fn check_expect(expect: &ExpectPolicy, count: usize) -> Result<()> {
    match expect {
        ExpectPolicy::Exactly(expected) if count > *expected => Err(BootstrapError::TooManyPeers {
            expected: *expected,
            found: count,
        }),
        _ => Ok(()),
    }
}

fn expect_satisfied(expect: &ExpectPolicy, count: usize) -> bool {
    match expect {
        ExpectPolicy::Unbounded => false,
        ExpectPolicy::Exactly(expected) => count == *expected,
        // Only named peers are admitted, so the count is enough.
        ExpectPolicy::Names(names) => count == names.len(),
    }
}

/// Turn an advertisement into a candidate, or explain in the log why not.
fn admit(
    handlers: &HandlerSet,
    session: &DiscoverySession,
    expect: &ExpectPolicy,
    found: &BTreeMap<String, CandidateSystem>,
    ad: Advertisement,
) -> Option<CandidateSystem> {
    if ad.name == handlers.local_name() || session.exclude.contains(&ad.name) {
        tracing::debug!(system = %ad.name, "advertisement_excluded");
        return None;
    }

    if let Some(existing) = found.get(&ad.name) {
        if existing.address != ad.address {
            tracing::warn!(
                system = %ad.name,
                known = %existing.address,
                conflicting = %ad.address,
                "conflicting_advertisement_ignored"
            );
        }
        return None;
    }

    if !HOSTNAME_RE.is_match(&ad.name) {
        tracing::warn!(system = %ad.name, "invalid_system_name");
        return None;
    }

    if ad.version != session.version {
        tracing::warn!(
            system = %ad.name,
            version = %ad.version,
            expected = %session.version,
            "incompatible_version"
        );
        return None;
    }

    if !session.subnet.contains(&ad.address) {
        tracing::debug!(system = %ad.name, address = %ad.address, "address_outside_subnet");
        return None;
    }

    if !ad.services.contains(&ServiceType::Core) || !ad.services.contains(&ServiceType::Hypervisor)
    {
        tracing::warn!(system = %ad.name, "mandatory_services_missing");
        return None;
    }

    if let ExpectPolicy::Names(names) = expect {
        if !names.contains(&ad.name) {
            tracing::debug!(system = %ad.name, "system_not_listed");
            return None;
        }
    }

    let mut system = CandidateSystem::new(ad.name, ad.address, ad.services);
    for service in handlers.services() {
        system.participate(service);
    }
    Some(system)
}
