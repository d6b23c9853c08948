// SPDX-License-Identifier: AGPL-3.0-only

//! Power votes over an external power controller
//!
//! The first vote enables the rail, the last release disables it. Votes are
//! RAII guards: dropping a [`PowerVote`] releases it, so no exit path of an
//! operation can leak one.

use crate::error::{NpuError, Result};
use crate::lock;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Power-rail and clock sequencing for the coprocessor
pub trait PowerController: Debug + Send + Sync {
    /// Bring the power domain up
    ///
    /// # Errors
    ///
    /// Returns error if the domain cannot be enabled.
    fn enable(&self) -> Result<()>;

    /// Take the power domain down (subject to the controller's own hysteresis)
    fn disable(&self);

    /// Whether the domain is currently up
    fn is_enabled(&self) -> bool;
}

/// Reference count of power votes
#[derive(Debug)]
pub struct PowerVotes {
    controller: Arc<dyn PowerController>,
    // Count changes and rail transitions happen under one lock so a 1→0
    // disable cannot interleave with a 0→1 enable.
    count: Mutex<u32>,
}

impl PowerVotes {
    /// Wrap `controller` with a zero vote count
    pub fn new(controller: Arc<dyn PowerController>) -> Arc<Self> {
        Arc::new(Self {
            controller,
            count: Mutex::new(0),
        })
    }

    /// Take a vote, enabling power if this is the first
    ///
    /// # Errors
    ///
    /// Returns error if the controller fails to enable the domain; the count
    /// is left unchanged.
    pub fn acquire(self: &Arc<Self>) -> Result<PowerVote> {
        let mut count = lock(&self.count);
        if *count == 0 {
            self.controller.enable()?;
            debug!("NPU power enabled");
        }
        *count += 1;
        Ok(PowerVote {
            votes: Arc::clone(self),
        })
    }

    fn release(&self) {
        let mut count = lock(&self.count);
        match *count {
            0 => warn!("power vote released with zero count"),
            1 => {
                *count = 0;
                self.controller.disable();
                debug!("NPU power disabled");
            }
            _ => *count -= 1,
        }
    }

    /// Outstanding votes
    pub fn count(&self) -> u32 {
        *lock(&self.count)
    }

    /// Whether the controller reports the domain up
    pub fn is_powered(&self) -> bool {
        self.controller.is_enabled()
    }
}

/// One outstanding power vote
#[derive(Debug)]
pub struct PowerVote {
    votes: Arc<PowerVotes>,
}

impl Drop for PowerVote {
    fn drop(&mut self) {
        self.votes.release();
    }
}

/// In-process power controller that records rail transitions
#[derive(Debug, Default)]
pub struct SoftwarePower {
    enabled: AtomicBool,
    enable_count: AtomicU32,
    refuse: AtomicBool,
}

impl SoftwarePower {
    /// Controller with the rail off
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `enable` calls fail
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Release);
    }

    /// How many times the rail has been brought up
    pub fn enable_count(&self) -> u32 {
        self.enable_count.load(Ordering::Acquire)
    }
}

impl PowerController for SoftwarePower {
    fn enable(&self) -> Result<()> {
        if self.refuse.load(Ordering::Acquire) {
            return Err(NpuError::power("rail enable refused"));
        }
        self.enabled.store(true, Ordering::Release);
        self.enable_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}
