// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport-aware timer values per RFC 3261 §17 Table 4.
//!
//! Unreliable transports (UDP) use the full timer set. Reliable transports
//! skip retransmissions entirely (Timers A/E) and zero the wait timers
//! (D/K), so transactions terminate as soon as their final response lands.

use crate::TransactionTimer;
use std::time::Duration;

/// Base timer values. T1 is the RTT estimate; implementations may shrink it
/// in tests but production use keeps the RFC defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerDefaults {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
}

impl Default for TimerDefaults {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Resolved timer table for one transaction.
#[derive(Debug, Clone, Copy)]
pub struct TransactionTimers {
    reliable: bool,
    defaults: TimerDefaults,
}

impl TransactionTimers {
    pub fn new(reliable: bool) -> Self {
        Self {
            reliable,
            defaults: TimerDefaults::default(),
        }
    }

    pub fn with_defaults(reliable: bool, defaults: TimerDefaults) -> Self {
        Self { reliable, defaults }
    }

    pub fn t1(&self) -> Duration {
        self.defaults.t1
    }

    pub fn t2(&self) -> Duration {
        self.defaults.t2
    }

    /// True when the transport needs transaction-layer retransmissions.
    pub fn retransmits(&self) -> bool {
        !self.reliable
    }

    /// Initial duration for `timer`. Zero means "fire immediately".
    pub fn duration(&self, timer: TransactionTimer) -> Duration {
        match timer {
            TransactionTimer::A | TransactionTimer::E => {
                if self.reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t1
                }
            }
            TransactionTimer::B | TransactionTimer::F => self.defaults.t1.saturating_mul(64),
            TransactionTimer::D => {
                if self.reliable {
                    Duration::ZERO
                } else {
                    Duration::from_secs(32)
                }
            }
            TransactionTimer::K => {
                if self.reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t4
                }
            }
        }
    }
}
