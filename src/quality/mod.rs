//! Quality Module - Stats-Normalisierung und MOS-Schätzung
//!
//! Dieses Modul bewertet die Gesprächsqualität:
//! - StatsCodec für rohe Transport-/Media-Statistiken
//! - periodischer Quality-Monitor mit MOS-Events

pub mod codec;
pub mod monitor;

pub use codec::{CandidatePairSample, LocalInboundSample, RemoteInboundSample, StatsSample};
pub use monitor::{calculate_mos, CallQualityMonitor, QualityError, QualityEvent, StatsSource};
