//! Generic state machine engine.
//!
//! A [`StateMachine`] holds a table of legal `(from, to)` transitions, each
//! bound to an [`Action`]. Executing a transition runs the action's guard,
//! body, error hook and finally hook against a caller-owned [`Context`].
//! The engine keeps no per-entity state: callers serialize transitions on
//! the same entity themselves.

use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, warn};

/// Bound for anything usable as a state.
pub trait State: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> State for T where T: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transition<S> {
    pub from: S,
    pub to: S,
}

impl<S> Transition<S> {
    pub fn new(from: S, to: S) -> Self {
        Self { from, to }
    }
}

impl<S: fmt::Display> fmt::Display for Transition<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Per-invocation state handed to actions.
pub struct Context<S, T> {
    current: S,
    to: S,
    error: Option<Error>,
    skip: bool,
    pub payload: T,
}

impl<S: State, T> Context<S, T> {
    pub fn new(current: S, payload: T) -> Self {
        Self {
            current,
            to: current,
            error: None,
            skip: false,
            payload,
        }
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// Target of the transition being executed.
    pub fn to(&self) -> S {
        self.to
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// Attach an error without failing the transition, e.g. the cause of a
    /// transition to a failure state.
    pub fn set_error(&mut self, error: Error) {
        self.error = Some(error);
    }

    pub fn is_skipped(&self) -> bool {
        self.skip
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<S: fmt::Debug, T> fmt::Debug for Context<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("current", &self.current)
            .field("to", &self.to)
            .field("error", &self.error)
            .field("skip", &self.skip)
            .finish_non_exhaustive()
    }
}

/// Handler bound to a transition.
#[async_trait]
pub trait Action<S: State, T: Send>: Send + Sync {
    /// Guard. Returning false skips the body and the error hook.
    async fn can_run(&self, _ctx: &mut Context<S, T>) -> bool {
        true
    }

    /// Body. A failure is captured into the context, it never propagates.
    async fn accept(&self, ctx: &mut Context<S, T>) -> Result<()>;

    /// Called after a failed body, with the error available on the context.
    async fn on_error(&self, _ctx: &mut Context<S, T>) {}

    /// Always called, whatever the guard or body did.
    async fn on_finally(&self, _ctx: &mut Context<S, T>) {}
}

/// Action with an empty body.
#[derive(Debug, Default, Clone, Copy)]
pub struct Noop;

#[async_trait]
impl<S: State, T: Send> Action<S, T> for Noop {
    async fn accept(&self, _ctx: &mut Context<S, T>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Body succeeded and the context moved to the target state.
    Applied,
    /// Guard declined; state unchanged.
    Skipped,
    /// Body failed; state unchanged, error captured on the context.
    Failed,
}

pub struct StateMachine<S: State, T: Send> {
    name: String,
    actions: HashMap<Transition<S>, Arc<dyn Action<S, T>>>,
    rows: HashMap<S, Vec<S>>,
    hooks: HashMap<S, Vec<Arc<dyn Action<S, T>>>>,
}

impl<S: State, T: Send> StateMachine<S, T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: HashMap::new(),
            rows: HashMap::new(),
            hooks: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a legal transition.
    pub fn add(&mut self, transition: Transition<S>, action: Arc<dyn Action<S, T>>) -> Result<()> {
        if self.actions.contains_key(&transition) {
            return Err(Error::TransitionExists {
                from: transition.from.to_string(),
                to: transition.to.to_string(),
            });
        }
        self.actions.insert(transition, action);
        self.rows.entry(transition.from).or_default().push(transition.to);
        Ok(())
    }

    /// Register `from -> to` for every target with the same action.
    pub fn add_row(&mut self, from: S, targets: &[S], action: Arc<dyn Action<S, T>>) -> Result<()> {
        for &to in targets {
            self.add(Transition::new(from, to), action.clone())?;
        }
        Ok(())
    }

    /// Run `action` after any transition that lands on one of `targets`.
    pub fn add_hook_on_target(&mut self, targets: &[S], action: Arc<dyn Action<S, T>>) {
        for &target in targets {
            self.hooks.entry(target).or_default().push(action.clone());
        }
    }

    pub fn is_legal(&self, from: S, to: S) -> bool {
        self.actions.contains_key(&Transition::new(from, to))
    }

    /// Legal targets from `from`, in registration order.
    pub fn legal_targets(&self, from: S) -> &[S] {
        self.rows.get(&from).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn transitions(&self) -> impl Iterator<Item = Transition<S>> + '_ {
        self.actions.keys().copied()
    }

    /// Execute `ctx.current() -> to`.
    ///
    /// Returns `Err(IllegalTransition)` for pairs outside the table, leaving
    /// the context untouched. Otherwise the outcome says whether the body
    /// ran and succeeded.
    pub async fn execute(&self, ctx: &mut Context<S, T>, to: S) -> Result<Outcome> {
        let transition = Transition::new(ctx.current, to);
        let action = self
            .actions
            .get(&transition)
            .cloned()
            .ok_or_else(|| Error::IllegalTransition {
                from: transition.from.to_string(),
                to: transition.to.to_string(),
            })?;

        ctx.to = to;
        ctx.skip = false;

        let outcome = run(action.as_ref(), ctx, Some(to)).await;

        match outcome {
            Outcome::Applied => {
                debug!(machine = %self.name, transition = %transition, "Transition applied");
                if let Some(hooks) = self.hooks.get(&to) {
                    for hook in hooks {
                        let carried = ctx.error.take();
                        if run(hook.as_ref(), ctx, None).await == Outcome::Failed
                            && let Some(err) = ctx.error.take()
                        {
                            warn!(
                                machine = %self.name,
                                transition = %transition,
                                error = %err,
                                "Target status hook failed"
                            );
                        }
                        ctx.error = carried;
                    }
                }
            }
            Outcome::Skipped => {
                debug!(machine = %self.name, transition = %transition, "Transition skipped by guard");
            }
            Outcome::Failed => {
                debug!(machine = %self.name, transition = %transition, "Transition body failed");
            }
        }

        Ok(outcome)
    }
}

async fn run<S: State, T: Send>(
    action: &dyn Action<S, T>,
    ctx: &mut Context<S, T>,
    advance_to: Option<S>,
) -> Outcome {
    let outcome = if !action.can_run(ctx).await {
        ctx.skip = true;
        Outcome::Skipped
    } else {
        match action.accept(ctx).await {
            Ok(()) => {
                if let Some(to) = advance_to {
                    ctx.current = to;
                }
                Outcome::Applied
            }
            Err(err) => {
                ctx.error = Some(err);
                action.on_error(ctx).await;
                Outcome::Failed
            }
        }
    };
    action.on_finally(ctx).await;
    outcome
}

impl<S: State, T: Send> fmt::Debug for StateMachine<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("transitions", &self.actions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Red,
        Green,
        Yellow,
    }

    impl fmt::Display for Light {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    #[derive(Default)]
    struct Counting {
        allow: bool,
        fail: bool,
        guard: AtomicUsize,
        body: AtomicUsize,
        error: AtomicUsize,
        finally: AtomicUsize,
    }

    #[async_trait]
    impl Action<Light, Vec<String>> for Counting {
        async fn can_run(&self, _ctx: &mut Context<Light, Vec<String>>) -> bool {
            self.guard.fetch_add(1, Ordering::SeqCst);
            self.allow
        }

        async fn accept(&self, ctx: &mut Context<Light, Vec<String>>) -> Result<()> {
            self.body.fetch_add(1, Ordering::SeqCst);
            ctx.payload.push(format!("{} -> {}", ctx.current(), ctx.to()));
            if self.fail {
                return Err(Error::Internal("boom".into()));
            }
            Ok(())
        }

        async fn on_error(&self, ctx: &mut Context<Light, Vec<String>>) {
            assert!(ctx.error().is_some());
            self.error.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_finally(&self, _ctx: &mut Context<Light, Vec<String>>) {
            self.finally.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting(allow: bool, fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            allow,
            fail,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_applied_transition_moves_current() {
        let action = counting(true, false);
        let mut sm = StateMachine::new("light");
        sm.add(Transition::new(Light::Red, Light::Green), action.clone())
            .unwrap();

        let mut ctx = Context::new(Light::Red, Vec::new());
        let outcome = sm.execute(&mut ctx, Light::Green).await.unwrap();

        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(ctx.current(), Light::Green);
        assert_eq!(ctx.payload, vec!["Red -> Green".to_string()]);
        assert_eq!(action.finally.load(Ordering::SeqCst), 1);
        assert_eq!(action.error.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_pair_is_illegal() {
        let mut sm: StateMachine<Light, Vec<String>> = StateMachine::new("light");
        sm.add(Transition::new(Light::Red, Light::Green), Arc::new(Noop))
            .unwrap();

        let mut ctx = Context::new(Light::Red, Vec::new());
        let err = sm.execute(&mut ctx, Light::Yellow).await.unwrap_err();

        assert!(matches!(err, Error::IllegalTransition { .. }));
        assert_eq!(ctx.current(), Light::Red);
        assert_eq!(ctx.to(), Light::Red);
    }

    #[tokio::test]
    async fn test_guard_false_runs_only_finally() {
        let action = counting(false, false);
        let mut sm = StateMachine::new("light");
        sm.add(Transition::new(Light::Red, Light::Green), action.clone())
            .unwrap();

        let mut ctx = Context::new(Light::Red, Vec::new());
        let outcome = sm.execute(&mut ctx, Light::Green).await.unwrap();

        assert_eq!(outcome, Outcome::Skipped);
        assert!(ctx.is_skipped());
        assert_eq!(ctx.current(), Light::Red);
        assert_eq!(action.body.load(Ordering::SeqCst), 0);
        assert_eq!(action.error.load(Ordering::SeqCst), 0);
        assert_eq!(action.finally.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_body_failure_captured() {
        let action = counting(true, true);
        let mut sm = StateMachine::new("light");
        sm.add(Transition::new(Light::Red, Light::Green), action.clone())
            .unwrap();

        let mut ctx = Context::new(Light::Red, Vec::new());
        let outcome = sm.execute(&mut ctx, Light::Green).await.unwrap();

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(ctx.current(), Light::Red);
        assert!(matches!(ctx.error(), Some(Error::Internal(_))));
        assert_eq!(action.error.load(Ordering::SeqCst), 1);
        assert_eq!(action.finally.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hooks_run_on_target() {
        let hook = counting(true, false);
        let mut sm = StateMachine::new("light");
        sm.add_row(Light::Red, &[Light::Green, Light::Yellow], Arc::new(Noop))
            .unwrap();
        sm.add_hook_on_target(&[Light::Yellow], hook.clone());

        let mut ctx = Context::new(Light::Red, Vec::new());
        sm.execute(&mut ctx, Light::Green).await.unwrap();
        assert_eq!(hook.body.load(Ordering::SeqCst), 0);

        let mut ctx = Context::new(Light::Red, Vec::new());
        sm.execute(&mut ctx, Light::Yellow).await.unwrap();
        assert_eq!(hook.body.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.current(), Light::Yellow);
    }

    #[test]
    fn test_duplicate_transition_rejected() {
        let mut sm: StateMachine<Light, ()> = StateMachine::new("light");
        sm.add(Transition::new(Light::Red, Light::Green), Arc::new(Noop))
            .unwrap();
        let err = sm
            .add(Transition::new(Light::Red, Light::Green), Arc::new(Noop))
            .unwrap_err();
        assert!(matches!(err, Error::TransitionExists { .. }));
        assert_eq!(sm.legal_targets(Light::Red), &[Light::Green]);
        assert!(sm.legal_targets(Light::Yellow).is_empty());
    }
}
