//! Session Module - Call-Orchestrierung
//!
//! Setzt Transport, Peer Connection, Audio, VAD und Quality-Monitor zu
//! einem Call-Lebenszyklus zusammen.

pub mod devices;
pub mod ice;
pub mod sdp;
pub mod session;

pub use devices::{AudioDeviceInfo, DeviceKind};
pub use ice::{IceConfigFetcher, IceError, StaticIceConfig};
pub use sdp::{set_video_bandwidth, BandwidthFormat};
pub use session::{CallSession, SessionError, SessionEvent};
