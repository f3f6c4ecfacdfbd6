//! The output type a profiling session produces (spec §3.1 `Profile`):
//! a flat, self-contained list of resolved samples plus enough session
//! metadata for a host to build a timeline or flamegraph without
//! needing to re-derive anything from the raw crates.

use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

pub use profiler_cpu_sampler::{ResolvedFrame, ResolvedSample};

/// `ResolvedFrame`/`ResolvedSample` already derive the ordinary
/// `Debug`/`Clone` set in `profiler-cpu-sampler`, but not `serde`: this
/// crate is the one with an opinion about wire formats (spec §5's
/// "public host-language wrapper API" is explicitly out of scope, but a
/// `serde`-shaped `Profile` is how that wrapper would eventually expose
/// this data), so the serializable mirror types live here instead of
/// adding a `serde` dependency to the sampling-hot-path crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableFrame {
    pub function: String,
    pub file: String,
    pub line: u32,
    pub is_native: bool,
}

impl From<&ResolvedFrame> for SerializableFrame {
    fn from(f: &ResolvedFrame) -> Self {
        Self {
            function: f.function.clone(),
            file: f.file.clone(),
            line: f.line,
            is_native: f.is_native,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableSample {
    pub timestamp_ns: u64,
    pub tid: u64,
    pub thread_name: Option<String>,
    pub frames: Vec<SerializableFrame>,
}

impl From<&ResolvedSample> for SerializableSample {
    fn from(s: &ResolvedSample) -> Self {
        Self {
            timestamp_ns: s.timestamp_ns,
            tid: s.tid,
            thread_name: s.thread_name.clone(),
            frames: s.frames.iter().map(SerializableFrame::from).collect(),
        }
    }
}

/// One completed CPU sampling session (spec §3.1 `Profile`, §4.5 stop
/// sequence's "emit Profile" final step).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub started_at_ns: u64,
    pub stopped_at_ns: u64,
    pub sample_interval_ns: u64,
    pub samples: Vec<SerializableSample>,
    pub total_overruns: u64,
    pub validation_drops: u64,
    /// Carried through unchanged from `CpuStartConfig::output_path`
    /// (spec §1: output formatting is an external collaborator's job,
    /// not this crate's — see `crate::cpu::CpuSampler::stop`).
    pub output_path: Option<PathBuf>,
}

impl Profile {
    pub fn duration_ns(&self) -> u64 {
        self.stopped_at_ns.saturating_sub(self.started_at_ns)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}
