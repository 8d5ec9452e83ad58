pub mod client;
pub mod discovery;
pub mod handler;
pub mod http;
pub mod negotiator;
pub mod preseed;
pub mod retry;
pub mod sequencer;
pub mod session;
pub mod strategy;

pub use client::{ClusterConfig, ServiceClient};
pub use discovery::{
    discover, AdvertisementSource, Beacon, BroadcastListener, ChannelSource, DiscoveryControl,
    DiscoveryLink, DiscoveryUpdate, DISCOVERY_PORT,
};
pub use handler::{HandlerSet, ServiceHandle, Timeouts};
pub use http::HttpServiceClient;
pub use negotiator::{NegotiatedPlan, NegotiationPolicy, ResourceNegotiator};
pub use retry::RetryPolicy;
pub use sequencer::ClusterFormationSequencer;
pub use session::BootstrapSession;
pub use strategy::{
    AutomaticStrategy, DiskChoices, NetworkChoices, PreseedStrategy, Selection, SelectionStrategy,
};
