//! Proxy pool with sticky credential bindings and health probing
//!
//! Two health views are kept on purpose:
//!
//! - The in-memory [`ProxyPool`] drives live selection. A proxy turns
//!   `Unhealthy` after [`MAX_CONSECUTIVE_FAILS`] failed uses or one failed
//!   probe, and `Healthy` again on the next success.
//! - The persisted [`ProxyRegistry`] view flips a proxy's `is_active` flag
//!   off only after [`AUTO_DISABLE_AFTER`] consecutive failed probes and back
//!   on with the next successful one. The flag is mirrored into the pool.
//!
//! Proxy lifecycle:
//! 1. Admin imports proxy lines → records stored, proxies added to the pool as `Unknown`
//! 2. A credential asks for a proxy → sticky binding recorded (capacity permitting)
//! 3. Connection failures → `mark_failed`; the credential rotates via `get_new_proxy_for`
//! 4. Background probe checks every proxy on an interval and updates both views

pub mod country;
pub mod error;
pub mod geo;
pub mod parse;
pub mod pool;
pub mod probe;
pub mod registry;

pub use country::country_for_phone;
pub use error::{Error, Result};
pub use geo::{GeoLookup, IpApiLookup};
pub use parse::{ParsedList, parse_proxy_line, parse_proxy_list};
pub use pool::{
    MAX_CONSECUTIVE_FAILS, PoolStats, ProxyAssignment, ProxyHealth, ProxyPool, ProxySeed,
    ProxySnapshot,
};
pub use probe::{
    HttpProber, ProbeOutcome, Prober, probe_cycle, record_pool_gauges, spawn_probe_task,
};
pub use registry::{AUTO_DISABLE_AFTER, ImportReport, ProxyRegistry, apply_check};
