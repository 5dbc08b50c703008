//! Cooldown-gated action sequences (attack, reload, cast).
//!
//! An action plays on its own tokio task. It suspends at every trigger
//! boundary and, when the plan asks for it, until external timing data
//! arrives. Starting a new action cancels the running one and waits for its
//! cleanup before the new one begins. Cleanup runs from a drop guard, so a
//! canceled or aborted task still reports how it ended.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::ActionError;
use crate::hitreg::HitRegistration;

/// Monotonic id of one started action.
pub type ActionId = u64;

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// What an action does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Fires projectiles on each trigger.
    Attack,
    /// Refills ammunition after one trigger.
    Reload,
    /// Skill whose trigger timing arrives from outside.
    Cast,
}

/// A timed sequence of triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionPlan {
    /// What the action does; cooldowns are tracked per kind.
    pub kind: ActionKind,
    /// Delay before each trigger, measured from the previous one.
    pub trigger_durations: Vec<Duration>,
    /// Tail after the last trigger before the action completes.
    pub recovery: Duration,
    /// Minimum time between two starts of the same kind.
    pub cooldown: Duration,
    /// Hold the first trigger until [`ActionController::provide_timing`]
    /// supplies the durations (e.g. from an animation clip).
    pub await_timing: bool,
}

impl ActionPlan {
    /// Attack timed by a hit registration's trigger durations.
    pub fn attack(registration: &HitRegistration, cooldown: Duration) -> Self {
        Self {
            kind: ActionKind::Attack,
            trigger_durations: registration.trigger_durations.iter().map(|s| seconds(*s)).collect(),
            recovery: Duration::ZERO,
            cooldown,
            await_timing: false,
        }
    }

    /// Single-trigger reload.
    pub fn reload(duration: Duration) -> Self {
        Self {
            kind: ActionKind::Reload,
            trigger_durations: vec![duration],
            recovery: Duration::ZERO,
            cooldown: Duration::ZERO,
            await_timing: false,
        }
    }

    /// Cast whose trigger timing comes from outside.
    pub fn cast(cooldown: Duration) -> Self {
        Self {
            kind: ActionKind::Cast,
            trigger_durations: Vec::new(),
            recovery: Duration::ZERO,
            cooldown,
            await_timing: true,
        }
    }

    /// Sets the recovery tail.
    pub fn with_recovery(mut self, recovery: Duration) -> Self {
        self.recovery = recovery;
        self
    }
}

fn seconds(value: f32) -> Duration {
    Duration::try_from_secs_f32(value.max(0.0)).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// State and events
// ---------------------------------------------------------------------------

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    /// Nothing has started yet.
    Idle,
    /// The action is running.
    Playing(ActionId),
    /// The action ran to its end.
    Completed(ActionId),
    /// The action was cancelled or replaced.
    Canceled(ActionId),
}

/// How an action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Every trigger fired and the recovery elapsed.
    Completed,
    /// Stopped early.
    Canceled,
}

/// Progress reported on the controller's event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionEvent {
    /// The action began playing.
    Started { id: ActionId, kind: ActionKind },
    /// A trigger boundary was reached; the caller fires its projectiles.
    Trigger { id: ActionId, kind: ActionKind, trigger_index: u8 },
    /// The action ended, see `outcome`.
    Finished { id: ActionId, kind: ActionKind, outcome: ActionOutcome },
}

/// Reports the outcome when the action task ends, however it ends.
struct CleanupGuard {
    id: ActionId,
    kind: ActionKind,
    completed: bool,
    state: Arc<watch::Sender<ActionState>>,
    events: mpsc::UnboundedSender<ActionEvent>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let (outcome, state) = if self.completed {
            (ActionOutcome::Completed, ActionState::Completed(self.id))
        } else {
            (ActionOutcome::Canceled, ActionState::Canceled(self.id))
        };
        self.state.send_replace(state);
        let _ = self.events.send(ActionEvent::Finished {
            id: self.id,
            kind: self.kind,
            outcome,
        });
        debug!(id = self.id, kind = ?self.kind, ?outcome, "action finished");
    }
}

// ---------------------------------------------------------------------------
// ActionController
// ---------------------------------------------------------------------------

struct Running {
    id: ActionId,
    cancel: watch::Sender<bool>,
    timing: Option<oneshot::Sender<Vec<Duration>>>,
    task: JoinHandle<ActionOutcome>,
}

/// Plays one action at a time for a single actor.
pub struct ActionController {
    state: Arc<watch::Sender<ActionState>>,
    events: mpsc::UnboundedSender<ActionEvent>,
    running: Option<Running>,
    ready_at: FxHashMap<ActionKind, Instant>,
    next_id: ActionId,
}

impl ActionController {
    /// Controller reporting progress on `events`. Must be used inside a
    /// tokio runtime.
    pub fn new(events: mpsc::UnboundedSender<ActionEvent>) -> Self {
        let (state, _) = watch::channel(ActionState::Idle);
        Self {
            state: Arc::new(state),
            events,
            running: None,
            ready_at: FxHashMap::default(),
            next_id: 1,
        }
    }

    /// Current state.
    pub fn state(&self) -> ActionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ActionState> {
        self.state.subscribe()
    }

    /// Starts `plan`, first canceling the running action and waiting for its
    /// cleanup. Fails without touching the running action when the plan's
    /// kind is still cooling down.
    pub async fn start(&mut self, plan: ActionPlan) -> Result<ActionId, ActionError> {
        if plan.trigger_durations.is_empty() && !plan.await_timing {
            return Err(ActionError::EmptyPlan(plan.kind));
        }
        let now = Instant::now();
        if let Some(ready_at) = self.ready_at.get(&plan.kind)
            && *ready_at > now
        {
            return Err(ActionError::CoolingDown {
                kind: plan.kind,
                remaining: *ready_at - now,
            });
        }

        self.cancel_and_wait().await;

        let id = self.next_id;
        self.next_id += 1;
        self.ready_at.insert(plan.kind, now + plan.cooldown);

        let (cancel, cancel_rx) = watch::channel(false);
        let (timing, timing_rx) = if plan.await_timing {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        self.state.send_replace(ActionState::Playing(id));
        let _ = self.events.send(ActionEvent::Started { id, kind: plan.kind });
        debug!(id, kind = ?plan.kind, triggers = plan.trigger_durations.len(), "action started");

        let guard = CleanupGuard {
            id,
            kind: plan.kind,
            completed: false,
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        };
        let task = tokio::spawn(play(plan, guard, cancel_rx, timing_rx));
        self.running = Some(Running { id, cancel, timing, task });
        Ok(id)
    }

    /// Supplies trigger durations to an action waiting for external timing.
    /// Returns `false` if no running action is waiting.
    pub fn provide_timing(&mut self, durations: Vec<Duration>) -> bool {
        let Some(sender) = self.running.as_mut().and_then(|r| r.timing.take()) else {
            return false;
        };
        sender.send(durations).is_ok()
    }

    /// Signals the running action to stop. Returns `false` when nothing is
    /// playing.
    pub fn cancel(&self) -> bool {
        match &self.running {
            Some(running) if !running.task.is_finished() => {
                running.cancel.send_replace(true);
                true
            }
            _ => false,
        }
    }

    /// Waits for the running action to end on its own.
    pub async fn wait(&mut self) -> Option<ActionOutcome> {
        let running = self.running.take()?;
        Some(running.task.await.unwrap_or(ActionOutcome::Canceled))
    }

    async fn cancel_and_wait(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.send_replace(true);
            let outcome = running.task.await.unwrap_or(ActionOutcome::Canceled);
            trace!(id = running.id, ?outcome, "previous action cleaned up");
        }
    }
}

impl Drop for ActionController {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.send_replace(true);
        }
    }
}

/// Resolves once cancellation is requested or the controller is gone.
async fn canceled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|flag| *flag).await;
}

/// Sleeps for `duration`; `false` if canceled first.
async fn sleep_unless_canceled(cancel: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = canceled(cancel) => false,
    }
}

async fn play(
    plan: ActionPlan,
    mut guard: CleanupGuard,
    mut cancel: watch::Receiver<bool>,
    timing: Option<oneshot::Receiver<Vec<Duration>>>,
) -> ActionOutcome {
    let mut durations = plan.trigger_durations;
    if let Some(timing) = timing {
        tokio::select! {
            provided = timing => {
                if let Ok(provided) = provided {
                    durations = provided;
                }
            }
            _ = canceled(&mut cancel) => return ActionOutcome::Canceled,
        }
    }

    for (index, duration) in durations.iter().enumerate().take(usize::from(u8::MAX)) {
        if !sleep_unless_canceled(&mut cancel, *duration).await {
            return ActionOutcome::Canceled;
        }
        let _ = guard.events.send(ActionEvent::Trigger {
            id: guard.id,
            kind: plan.kind,
            trigger_index: index as u8,
        });
    }
    if !sleep_unless_canceled(&mut cancel, plan.recovery).await {
        return ActionOutcome::Canceled;
    }

    guard.completed = true;
    ActionOutcome::Completed
}
