pub mod discovery;
pub mod formation;
pub mod preseed;
pub mod service;
pub mod session;
pub mod system;

pub use discovery::{Advertisement, DiscoverySession, ExpectPolicy};
pub use formation::{Exclusion, FormationEvent, FormationOutcome, FormationReport, JoinState};
pub use preseed::Preseed;
pub use service::ServiceType;
pub use session::{InputMode, SessionConfig, SessionKind};
pub use system::{
    CandidateSystem, DiskInfo, DiskPurpose, DiskSelection, ExternalNetwork, Ipv4Range,
    NetIfaceInfo, NetworkPlan, Reachability, ResourceReport,
};
