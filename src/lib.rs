// Map overlay synchronizer: keeps a rendered set of blip and player markers in step with
// a remote game server's snapshot and live feed.

pub mod api;
pub mod config;
pub mod metrics;
pub mod overlay;
pub mod protocol;
pub mod session;
pub mod synchronizer;
pub mod transport;
