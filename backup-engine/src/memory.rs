//! Process memory accounting.
//!
//! The engines never trust their own bookkeeping for memory: they ask a
//! [`MemoryProbe`] for the resident size of the process and compare it with the
//! configured ceiling. Tests substitute a scripted probe.

use crate::config::MemorySettings;
use crate::utils::{EngineError, Result};
use std::sync::Mutex;
use tracing::{debug, info, warn};

const MIB: u64 = 1024 * 1024;
const FALLBACK_LIMIT: u64 = 256 * MIB;

/// Source of memory measurements.
pub trait MemoryProbe: Send + Sync {
    /// Bytes currently in use by the process.
    fn used_bytes(&self) -> u64;
}

/// Reads the resident set size of the current process through `sysinfo`.
pub struct SystemProbe {
    system: Mutex<sysinfo::System>,
    pid: Option<sysinfo::Pid>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemProbe {
    fn used_bytes(&self) -> u64 {
        let Some(pid) = self.pid else { return 0 };
        let Ok(mut system) = self.system.lock() else { return 0 };
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// Memory pressure classification relative to the watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    Low,
    Normal,
    High,
}

/// Combines a probe with the configured ceiling and watermarks.
pub struct MemoryGuard {
    probe: Box<dyn MemoryProbe>,
    limit: Mutex<u64>,
    settings: MemorySettings,
}

impl MemoryGuard {
    pub fn new(probe: Box<dyn MemoryProbe>, settings: MemorySettings) -> Self {
        let limit = settings
            .limit_mb
            .map(|mb| mb * MIB)
            .or_else(address_space_limit)
            .unwrap_or(FALLBACK_LIMIT);
        Self {
            probe,
            limit: Mutex::new(limit),
            settings,
        }
    }

    /// Guard backed by the real process probe.
    pub fn system(settings: MemorySettings) -> Self {
        Self::new(Box::new(SystemProbe::new()), settings)
    }

    pub fn limit(&self) -> u64 {
        self.limit.lock().map(|l| *l).unwrap_or(FALLBACK_LIMIT)
    }

    pub fn used(&self) -> u64 {
        self.probe.used_bytes()
    }

    /// Current usage as a fraction of the ceiling.
    pub fn ratio(&self) -> f64 {
        let limit = self.limit();
        if limit == 0 {
            return 0.0;
        }
        self.used() as f64 / limit as f64
    }

    pub fn pressure(&self) -> Pressure {
        classify(self.ratio(), &self.settings)
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    /// Check pressure after a relief pass has run.
    ///
    /// Returns `ResourceExhausted` when usage is still above the critical
    /// watermark.
    pub fn check_after_relief(&self) -> Result<()> {
        let used = self.used();
        let limit = self.limit();
        if limit > 0 && used as f64 / limit as f64 >= self.settings.critical_water {
            warn!(used, limit, "memory pressure persists after relief");
            return Err(EngineError::ResourceExhausted { used, limit });
        }
        Ok(())
    }

    /// Make sure `required` more bytes fit under the ceiling, raising the
    /// process limit when the runtime allows it.
    pub fn ensure_headroom(&self, required: u64) -> Result<()> {
        let used = self.used();
        let limit = self.limit();
        let wanted = used.saturating_add(required);
        if wanted <= limit {
            return Ok(());
        }

        debug!(used, required, limit, "insufficient headroom, trying to raise ceiling");
        if let Some(raised) = raise_address_space_limit(wanted) {
            if let Ok(mut guard) = self.limit.lock() {
                *guard = raised;
            }
            info!(new_limit = raised, "raised process memory ceiling");
            if wanted <= raised {
                return Ok(());
            }
        }
        Err(EngineError::ResourceExhausted { used: wanted, limit })
    }
}

/// Map a usage ratio to a pressure class.
pub fn classify(ratio: f64, settings: &MemorySettings) -> Pressure {
    if ratio >= settings.high_water {
        Pressure::High
    } else if ratio < settings.low_water {
        Pressure::Low
    } else {
        Pressure::Normal
    }
}

#[cfg(unix)]
fn address_space_limit() -> Option<u64> {
    use nix::sys::resource::{getrlimit, Resource, RLIM_INFINITY};
    match getrlimit(Resource::RLIMIT_AS) {
        Ok((soft, _)) if soft != RLIM_INFINITY => Some(soft as u64),
        _ => None,
    }
}

#[cfg(not(unix))]
fn address_space_limit() -> Option<u64> {
    None
}

/// Raise the soft address-space limit towards `wanted`, bounded by the hard
/// limit. Returns the new soft limit if it changed.
#[cfg(unix)]
fn raise_address_space_limit(wanted: u64) -> Option<u64> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource, RLIM_INFINITY};
    let (soft, hard) = getrlimit(Resource::RLIMIT_AS).ok()?;
    if soft == RLIM_INFINITY {
        return None;
    }
    let target = if hard == RLIM_INFINITY {
        wanted as nix::sys::resource::rlim_t
    } else {
        (wanted as nix::sys::resource::rlim_t).min(hard)
    };
    if target <= soft {
        return None;
    }
    setrlimit(Resource::RLIMIT_AS, target, hard).ok()?;
    Some(target as u64)
}

#[cfg(not(unix))]
fn raise_address_space_limit(_wanted: u64) -> Option<u64> {
    None
}
