//! Low Memory Monitor
//!
//! Samples the number of pages an ordinary reservation can still obtain
//! and classifies it against three descending thresholds. When the level
//! moves to a pressure level every registered handler runs, highest
//! priority first, with the monitor lock held.
//!
//! Handlers must not register or unregister handlers; the lock is not
//! recursive.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::context::MmConfig;
use super::pfn::PfnDatabase;

/// Memory pressure, least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LowMemoryLevel {
    Normal,
    Note,
    Warning,
    Critical,
}

impl fmt::Display for LowMemoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LowMemoryLevel::Normal => "normal",
            LowMemoryLevel::Note => "note",
            LowMemoryLevel::Warning => "warning",
            LowMemoryLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Handler callback
pub type LowMemoryHandler = Box<dyn Fn(LowMemoryLevel) + Send + Sync>;

/// Returned by [`LowMemoryMonitor::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowMemoryHandle(u64);

/// Available-page counts at which each level begins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowMemoryThresholds {
    pub note: usize,
    pub warning: usize,
    pub critical: usize,
}

impl LowMemoryThresholds {
    pub fn from_config(total_pages: usize, config: &MmConfig) -> Self {
        let pages = |percent: usize| total_pages * percent / 100;
        let critical = pages(config.low_memory_critical_percent).max(1);
        let warning = pages(config.low_memory_warning_percent).max(critical);
        let note = pages(config.low_memory_note_percent).max(warning);
        Self {
            note,
            warning,
            critical,
        }
    }

    pub fn classify(&self, available: usize) -> LowMemoryLevel {
        if available < self.critical {
            LowMemoryLevel::Critical
        } else if available < self.warning {
            LowMemoryLevel::Warning
        } else if available < self.note {
            LowMemoryLevel::Note
        } else {
            LowMemoryLevel::Normal
        }
    }
}

struct RegisteredHandler {
    handle: LowMemoryHandle,
    name: &'static str,
    priority: i32,
    callback: LowMemoryHandler,
}

struct MonitorState {
    handlers: Vec<RegisteredHandler>,
    level: LowMemoryLevel,
    last_poll: Option<u64>,
    next_handle: u64,
}

pub struct LowMemoryMonitor {
    pfn: Arc<PfnDatabase>,
    thresholds: LowMemoryThresholds,
    poll_ms: u64,
    state: Mutex<MonitorState>,
    notifications: AtomicU64,
}

impl LowMemoryMonitor {
    pub fn new(pfn: Arc<PfnDatabase>, config: &MmConfig) -> Self {
        let thresholds = LowMemoryThresholds::from_config(pfn.total_pages(), config);
        log::debug!(
            "[LOWMEM] thresholds note={} warning={} critical={} pages",
            thresholds.note,
            thresholds.warning,
            thresholds.critical
        );
        Self {
            pfn,
            thresholds,
            poll_ms: config.low_memory_poll_ms,
            state: Mutex::new(MonitorState {
                handlers: Vec::new(),
                level: LowMemoryLevel::Normal,
                last_poll: None,
                next_handle: 1,
            }),
            notifications: AtomicU64::new(0),
        }
    }

    pub fn thresholds(&self) -> LowMemoryThresholds {
        self.thresholds
    }

    /// Add a handler; among equal priorities the earlier one runs first
    pub fn register(
        &self,
        name: &'static str,
        priority: i32,
        callback: LowMemoryHandler,
    ) -> LowMemoryHandle {
        let mut state = self.state.lock();
        let handle = LowMemoryHandle(state.next_handle);
        state.next_handle += 1;
        let position = state
            .handlers
            .iter()
            .position(|h| h.priority < priority)
            .unwrap_or(state.handlers.len());
        state.handlers.insert(
            position,
            RegisteredHandler {
                handle,
                name,
                priority,
                callback,
            },
        );
        handle
    }

    pub fn unregister(&self, handle: LowMemoryHandle) -> bool {
        let mut state = self.state.lock();
        let before = state.handlers.len();
        state.handlers.retain(|h| h.handle != handle);
        state.handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.state.lock().handlers.len()
    }

    pub fn current_level(&self) -> LowMemoryLevel {
        self.state.lock().level
    }

    /// Times handlers were notified
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }

    /// Sample the allocator and notify on a level change
    pub fn check(&self) -> LowMemoryLevel {
        let mut state = self.state.lock();
        self.sample_locked(&mut state, false)
    }

    /// A reservation is waiting for pages
    ///
    /// Runs the handlers at the current pressure level even if it has not
    /// changed. Returns `None` without sampling when the handlers are
    /// already running on another thread.
    pub fn kick(&self) -> Option<LowMemoryLevel> {
        let mut state = self.state.try_lock()?;
        Some(self.sample_locked(&mut state, true))
    }

    fn sample_locked(&self, state: &mut MonitorState, force: bool) -> LowMemoryLevel {
        let available = self.pfn.available_pages();
        let level = self.thresholds.classify(available);
        if level == state.level {
            if force && level != LowMemoryLevel::Normal {
                self.notify_locked(state, level);
            }
            return level;
        }

        if level > state.level {
            log::warn!(
                "[LOWMEM] {} -> {} ({} pages available)",
                state.level,
                level,
                available
            );
        } else {
            log::info!(
                "[LOWMEM] {} -> {} ({} pages available)",
                state.level,
                level,
                available
            );
        }
        state.level = level;

        if level != LowMemoryLevel::Normal {
            self.notify_locked(state, level);
        }
        level
    }

    fn notify_locked(&self, state: &MonitorState, level: LowMemoryLevel) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
        for handler in &state.handlers {
            log::trace!("[LOWMEM] notify '{}' ({})", handler.name, handler.priority);
            (handler.callback)(level);
        }
    }

    /// Periodic entry; checks at most once per poll interval
    pub fn tick(&self, now_ms: u64) -> Option<LowMemoryLevel> {
        {
            let mut state = self.state.lock();
            if let Some(last) = state.last_poll {
                if now_ms.saturating_sub(last) < self.poll_ms {
                    return None;
                }
            }
            state.last_poll = Some(now_ms);
        }
        Some(self.check())
    }
}
