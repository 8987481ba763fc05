//! # Performance Monitor
//!
//! Discovery of the hardware performance counters a pipe exposes.
//!
//! The kernel describes counters as domains (a hardware block such as the
//! pixel engine) each holding a list of signals. Both lists are walked with
//! an iterator value the kernel hands back; the walk ends at the end marker.
//! A [`PerfSignal`] found here is what a
//! [`PerfRecord`](crate::stream::PerfRecord) samples.

use cinder_core::transport::{PERF_DOMAIN_END, PERF_SIGNAL_END};
use cinder_core::{Error, PipeId, Result, Transport};

use crate::pipe::Pipe;

// =============================================================================
// SIGNALS & DOMAINS
// =============================================================================

/// One sampleable counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfSignal {
    domain: u8,
    id: u16,
    name: String,
}

impl PerfSignal {
    /// Domain the signal belongs to
    pub fn domain(&self) -> u8 {
        self.domain
    }

    /// Signal id inside its domain
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Signal name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A group of signals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfDomain {
    id: u8,
    name: String,
    signals: Vec<PerfSignal>,
}

impl PerfDomain {
    /// Domain id
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Domain name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All signals of the domain
    pub fn signals(&self) -> &[PerfSignal] {
        &self.signals
    }

    /// Look up a signal by name
    pub fn signal(&self, name: &str) -> Option<&PerfSignal> {
        self.signals.iter().find(|s| s.name == name)
    }
}

// =============================================================================
// MONITOR
// =============================================================================

/// Every perf domain of one pipe
#[derive(Debug, Clone)]
pub struct PerfMonitor {
    pipe: PipeId,
    domains: Vec<PerfDomain>,
}

impl PerfMonitor {
    /// Enumerate the domains and signals of `pipe`
    pub fn new<T: Transport>(pipe: &Pipe<T>) -> Result<Self> {
        let transport = pipe.device().transport();
        let core = pipe.gpu().core();
        let pipe_id = pipe.id();

        let mut domains = Vec::new();
        let mut iter = 0u8;
        // A u8 iterator cannot name more than 255 domains.
        for _ in 0..u8::MAX {
            let desc = transport
                .perfmon_domain(core, pipe_id.raw(), iter)
                .map_err(Error::Transport)?;

            let mut signals = Vec::with_capacity(desc.nr_signals as usize);
            let mut sig_iter = 0u16;
            for _ in 0..desc.nr_signals {
                let sig = transport
                    .perfmon_signal(core, pipe_id.raw(), desc.id, sig_iter)
                    .map_err(Error::Transport)?;
                signals.push(PerfSignal {
                    domain: desc.id,
                    id: sig.id,
                    name: sig.name,
                });
                if sig.next == PERF_SIGNAL_END {
                    break;
                }
                sig_iter = sig.next;
            }

            log::debug!("perf domain {} ({} signals)", desc.name, signals.len());
            domains.push(PerfDomain {
                id: desc.id,
                name: desc.name,
                signals,
            });

            if desc.next == PERF_DOMAIN_END {
                break;
            }
            iter = desc.next;
        }

        Ok(Self {
            pipe: pipe_id,
            domains,
        })
    }

    /// Pipe the domains were read from
    pub fn pipe(&self) -> PipeId {
        self.pipe
    }

    /// All domains
    pub fn domains(&self) -> &[PerfDomain] {
        &self.domains
    }

    /// Look up a domain by name
    pub fn domain(&self, name: &str) -> Option<&PerfDomain> {
        self.domains.iter().find(|d| d.name == name)
    }

    /// Look up a signal by domain and signal name
    pub fn signal(&self, domain: &str, signal: &str) -> Result<&PerfSignal> {
        self.domain(domain)
            .and_then(|d| d.signal(signal))
            .ok_or(Error::NotFound)
    }
}
