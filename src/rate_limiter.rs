//! Fixed-window and sliding-window admission control.
//!
//! [`RateLimiter`] guards a single budget (e.g. connection opens per
//! second). [`DeliveryLimiter`] layers a global budget with per-chat and
//! per-user budgets, keeps one window per chat and per user, and forgets
//! idle ones; a send is admitted only when all three have room.
//!
//! Every check has an `_at` variant taking the current instant so callers
//! and tests can drive the clock explicitly. Instants are
//! [`tokio::time::Instant`], which also honours paused test time.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// How a window counts calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Counts calls within the trailing `period`.
    Sliding,
    /// Counts calls since the current window started; resets every `period`.
    Fixed,
}

/// A single admission window.
#[derive(Debug, Clone)]
pub struct Window {
    max_calls: usize,
    period: Duration,
    state: WindowState,
}

#[derive(Debug, Clone)]
enum WindowState {
    Sliding(VecDeque<Instant>),
    Fixed { started: Option<Instant>, count: usize },
}

impl Window {
    pub fn new(kind: WindowKind, max_calls: usize, period: Duration) -> Self {
        let state = match kind {
            WindowKind::Sliding => WindowState::Sliding(VecDeque::with_capacity(max_calls)),
            WindowKind::Fixed => WindowState::Fixed {
                started: None,
                count: 0,
            },
        };
        Self {
            max_calls,
            period,
            state,
        }
    }

    pub fn sliding(max_calls: usize, period: Duration) -> Self {
        Self::new(WindowKind::Sliding, max_calls, period)
    }

    pub fn fixed(max_calls: usize, period: Duration) -> Self {
        Self::new(WindowKind::Fixed, max_calls, period)
    }

    fn expire(&mut self, now: Instant) {
        match &mut self.state {
            WindowState::Sliding(calls) => {
                while let Some(first) = calls.front() {
                    if now.saturating_duration_since(*first) >= self.period {
                        calls.pop_front();
                    } else {
                        break;
                    }
                }
            }
            WindowState::Fixed { started, count } => {
                if let Some(start) = started
                    && now.saturating_duration_since(*start) >= self.period
                {
                    *started = None;
                    *count = 0;
                }
            }
        }
    }

    fn used(&self) -> usize {
        match &self.state {
            WindowState::Sliding(calls) => calls.len(),
            WindowState::Fixed { count, .. } => *count,
        }
    }

    /// Calls still admissible in the current window.
    pub fn remaining_at(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.max_calls.saturating_sub(self.used())
    }

    /// How long until one more call would be admitted (zero if now).
    pub fn wait_time_at(&mut self, now: Instant) -> Duration {
        self.expire(now);
        if self.used() < self.max_calls {
            return Duration::ZERO;
        }
        let oldest = match &self.state {
            WindowState::Sliding(calls) => calls.front().copied(),
            WindowState::Fixed { started, .. } => *started,
        };
        oldest
            .map(|t| self.period.saturating_sub(now.saturating_duration_since(t)))
            .unwrap_or(self.period)
    }

    /// Records a call without checking capacity.
    pub fn record(&mut self, now: Instant) {
        match &mut self.state {
            WindowState::Sliding(calls) => calls.push_back(now),
            WindowState::Fixed { started, count } => {
                started.get_or_insert(now);
                *count += 1;
            }
        }
    }

    /// Admits and records one call if there is room.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        if self.remaining_at(now) == 0 {
            return false;
        }
        self.record(now);
        true
    }

    /// Time of the most recent recorded call, if any.
    fn last_call(&self) -> Option<Instant> {
        match &self.state {
            WindowState::Sliding(calls) => calls.back().copied(),
            WindowState::Fixed { started, .. } => *started,
        }
    }
}

/// A shared, thread-safe admission window.
#[derive(Debug)]
pub struct RateLimiter {
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(kind: WindowKind, max_calls: usize, period: Duration) -> Self {
        Self {
            window: Mutex::new(Window::new(kind, max_calls, period)),
        }
    }

    /// A sliding-window limiter: at most `max_calls` in any trailing `period`.
    pub fn sliding(max_calls: usize, period: Duration) -> Self {
        Self::new(WindowKind::Sliding, max_calls, period)
    }

    /// A fixed-window limiter: at most `max_calls` per `period`-long window.
    pub fn fixed(max_calls: usize, period: Duration) -> Self {
        Self::new(WindowKind::Fixed, max_calls, period)
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        self.window.lock().try_acquire_at(now)
    }

    pub fn remaining(&self) -> usize {
        self.window.lock().remaining_at(Instant::now())
    }

    pub fn wait_time(&self) -> Duration {
        self.window.lock().wait_time_at(Instant::now())
    }

    /// Waits until a call is admitted, then records it.
    ///
    /// The lock is never held across the sleep.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock();
                let now = Instant::now();
                if window.try_acquire_at(now) {
                    return;
                }
                window.wait_time_at(now)
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

/// Budgets applied to every outbound send.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryLimits {
    pub global_max: usize,
    pub global_period: Duration,
    pub per_chat_max: usize,
    pub per_chat_period: Duration,
    pub per_user_max: usize,
    pub per_user_period: Duration,
}

impl Default for DeliveryLimits {
    fn default() -> Self {
        Self {
            global_max: 30,
            global_period: Duration::from_secs(1),
            per_chat_max: 1,
            per_chat_period: Duration::from_secs(1),
            per_user_max: 20,
            per_user_period: Duration::from_secs(60),
        }
    }
}

/// Which layer refused a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    Global(Duration),
    Chat(Duration),
    User(Duration),
}

impl Throttle {
    pub fn retry_after(self) -> Duration {
        match self {
            Self::Global(d) | Self::Chat(d) | Self::User(d) => d,
        }
    }
}

#[derive(Debug)]
struct DeliveryWindows {
    global: Window,
    chats: HashMap<i64, Window>,
    users: HashMap<i64, Window>,
}

/// Global + per-chat + per-user limiter. Checks and records happen under
/// one lock, so a send either consumes from every layer or from none.
#[derive(Debug)]
pub struct DeliveryLimiter {
    limits: DeliveryLimits,
    windows: Mutex<DeliveryWindows>,
}

impl DeliveryLimiter {
    pub fn new(limits: DeliveryLimits) -> Self {
        Self {
            limits,
            windows: Mutex::new(DeliveryWindows {
                global: Window::sliding(limits.global_max, limits.global_period),
                chats: HashMap::new(),
                users: HashMap::new(),
            }),
        }
    }

    pub fn limits(&self) -> DeliveryLimits {
        self.limits
    }

    /// Sends the global window still admits right now.
    pub fn global_remaining_at(&self, now: Instant) -> usize {
        self.windows.lock().global.remaining_at(now)
    }

    /// Admits one send to `chat_id` on behalf of `user_id`, or reports
    /// which layer refused and for how long.
    pub fn try_acquire_at(
        &self,
        chat_id: i64,
        user_id: i64,
        now: Instant,
    ) -> Result<(), Throttle> {
        let limits = self.limits;
        let mut guard = self.windows.lock();
        let windows = &mut *guard;

        let wait = windows.global.wait_time_at(now);
        if !wait.is_zero() {
            return Err(Throttle::Global(wait));
        }

        let chat = windows
            .chats
            .entry(chat_id)
            .or_insert_with(|| Window::sliding(limits.per_chat_max, limits.per_chat_period));
        let wait = chat.wait_time_at(now);
        if !wait.is_zero() {
            return Err(Throttle::Chat(wait));
        }

        let user = windows
            .users
            .entry(user_id)
            .or_insert_with(|| Window::sliding(limits.per_user_max, limits.per_user_period));
        let wait = user.wait_time_at(now);
        if !wait.is_zero() {
            return Err(Throttle::User(wait));
        }

        user.record(now);
        if let Some(chat) = windows.chats.get_mut(&chat_id) {
            chat.record(now);
        }
        windows.global.record(now);
        Ok(())
    }

    pub fn try_acquire(&self, chat_id: i64, user_id: i64) -> Result<(), Throttle> {
        self.try_acquire_at(chat_id, user_id, Instant::now())
    }

    /// Forgets per-chat and per-user windows idle for longer than `idle`.
    pub fn prune_idle(&self, idle: Duration, now: Instant) {
        let mut windows = self.windows.lock();
        let keep = |w: &Window| {
            w.last_call()
                .is_some_and(|t| now.saturating_duration_since(t) <= idle)
        };
        windows.chats.retain(|_, w| keep(w));
        windows.users.retain(|_, w| keep(w));
    }
}
