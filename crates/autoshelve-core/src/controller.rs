//! Host-side driver for the engine.
//!
//! [`HostController`] translates host notifications (debugger mode changes,
//! solution open/close, manual toggles, options changes) into engine calls,
//! and owns the "paused by debugger" flag.
//!
//! Manual start and stop always clear that flag, so leaving the debugger does
//! not resume an engine the user stopped by hand. A debugger transition that
//! races a manual toggle is not guarded against; the outcome depends on which
//! call lands last.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::engine::{AutoShelve, ShelveRun};
use crate::error::ShelveResult;

/// Engine state as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Paused,
    Running,
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paused => write!(f, "Auto Shelve paused"),
            Self::Running => write!(f, "Auto Shelve running"),
            Self::Stopped => write!(f, "Auto Shelve stopped"),
        }
    }
}

pub struct HostController {
    engine: AutoShelve,
    paused: AtomicBool,
}

impl HostController {
    pub fn new(engine: AutoShelve) -> Self {
        Self {
            engine,
            paused: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &AutoShelve {
        &self.engine
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stop if running, start otherwise.
    pub fn toggle_run_state(&self) {
        self.paused.store(false, Ordering::SeqCst);
        if self.engine.is_running() {
            self.engine.stop();
        } else {
            self.engine.start();
        }
    }

    pub fn manual_start(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.engine.start();
    }

    pub fn manual_stop(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.engine.stop();
    }

    /// Shelve every workspace now, regardless of the last shelveset.
    pub async fn shelve_now(&self) -> ShelveRun {
        self.engine.create_shelveset(true).await
    }

    /// A debugging session started.
    pub fn enter_run_mode(&self) {
        if !self.engine.pause_on_debug() || self.is_paused() {
            return;
        }
        self.paused.store(true, Ordering::SeqCst);
        self.engine.stop();
        info!("Paused while debugging");
    }

    /// The debugging session ended. Resumes a paused engine after one forced attempt.
    pub async fn enter_design_mode(&self) -> Option<ShelveRun> {
        if !self.is_paused() {
            return None;
        }
        let run = self.engine.create_shelveset(true).await;
        self.engine.start();
        self.paused.store(false, Ordering::SeqCst);
        info!("Resumed after debugging");
        Some(run)
    }

    pub fn solution_opened(&self) {
        if !self.engine.is_running() {
            self.engine.start();
        }
    }

    /// Run one final forced attempt if the engine is running.
    ///
    /// Await the returned run before tearing the engine down.
    pub async fn solution_closed(&self) -> Option<ShelveRun> {
        if !self.engine.is_running() {
            return None;
        }
        debug!("Final shelve attempt before close");
        Some(self.engine.create_shelveset(true).await)
    }

    /// Push changed options into the engine.
    pub fn apply_options(&self, options: &EngineConfig) -> ShelveResult<()> {
        self.engine.apply(options)?;
        debug!("Applied options {:?}", options);
        Ok(())
    }

    pub fn run_state(&self) -> RunState {
        if self.is_paused() {
            RunState::Paused
        } else if self.engine.is_running() {
            RunState::Running
        } else {
            RunState::Stopped
        }
    }
}
