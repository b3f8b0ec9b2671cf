//! Creating a proxy pod, forwarding to it, and cleaning up afterwards.
//!
//! A session moves through these states:
//!
//! ```text
//! ABSENT -> CREATING -> WAITING_READY -> READY | TIMED_OUT
//!     -> FORWARDING -> ENDED_NORMALLY | INTERRUPTED
//!     -> CLEANED_UP | LEFT_RUNNING
//! ```
//!
//! A pod which already exists starts out `READY`, without re-checking it.

use std::thread::sleep;

use crate::{
    errors::DisplayCausesExt,
    interrupt,
    kubernetes::{Cluster, ForwardEnd},
    manifest::proxy_pod_manifest,
    prelude::*,
    session::ProxySession,
};

/// Where a proxy session is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// No pod with our name exists.
    Absent,
    /// We've asked the cluster to create our pod.
    Creating,
    /// We're polling until the pod is running.
    WaitingReady,
    /// The pod is running (or already existed).
    Ready,
    /// The pod didn't reach `Running` in time.
    TimedOut,
    /// `kubectl port-forward` is running.
    Forwarding,
    /// The port-forward exited on its own.
    EndedNormally,
    /// The user interrupted us.
    Interrupted,
    /// We deleted the pod.
    CleanedUp,
    /// The pod is still there, either on purpose or because deleting failed.
    LeftRunning,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Absent => "ABSENT",
            SessionState::Creating => "CREATING",
            SessionState::WaitingReady => "WAITING_READY",
            SessionState::Ready => "READY",
            SessionState::TimedOut => "TIMED_OUT",
            SessionState::Forwarding => "FORWARDING",
            SessionState::EndedNormally => "ENDED_NORMALLY",
            SessionState::Interrupted => "INTERRUPTED",
            SessionState::CleanedUp => "CLEANED_UP",
            SessionState::LeftRunning => "LEFT_RUNNING",
        };
        f.write_str(name)
    }
}

/// How long we wait for a new pod to start running.
#[derive(Clone, Debug)]
pub struct WaitPolicy {
    /// The maximum number of times we check the pod's status.
    pub attempts: u32,
    /// How long we sleep between checks.
    pub interval: Duration,
    /// Give up (after cleaning up) if the pod never starts running. By
    /// default we try to forward anyway.
    pub fail_on_timeout: bool,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy {
            attempts: 10,
            interval: Duration::from_secs(1),
            fail_on_timeout: false,
        }
    }
}

/// What happened during a session which didn't fail.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Outcome {
    /// Either `CleanedUp` or `LeftRunning`, or `Interrupted` if we were
    /// interrupted before we found out whether the pod exists.
    pub final_state: SessionState,
    /// How the port-forward ended, if we got that far.
    pub forward: Option<ForwardEnd>,
    /// Every state we passed through, in order.
    pub history: Vec<SessionState>,
}

/// The result of waiting for a pod.
enum Readiness {
    Running,
    TimedOut,
    Interrupted,
}

/// Drives a [`ProxySession`] against a [`Cluster`].
pub struct Orchestrator<C> {
    cluster: C,
    wait: WaitPolicy,
    interrupted: Box<dyn Fn() -> bool>,
}

impl<C: Cluster> Orchestrator<C> {
    /// Create an orchestrator which notices interrupts using
    /// [`interrupt::interrupted`].
    pub fn new(cluster: C, wait: WaitPolicy) -> Self {
        Orchestrator {
            cluster,
            wait,
            interrupted: Box::new(interrupt::interrupted),
        }
    }

    /// Use `check` to find out whether we've been interrupted.
    pub fn with_interrupt_check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + 'static,
    {
        self.interrupted = Box::new(check);
        self
    }

    /// Our cluster.
    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    /// Run a complete session. This blocks for as long as the port-forward
    /// is open.
    ///
    /// Once our pod exists, we always try to clean it up (unless
    /// `skip_cleanup` is set), even if waiting or forwarding fails, or
    /// creating it was interrupted. Failing to delete the pod is logged, but
    /// doesn't affect our result. A `kubectl` call which fails after an
    /// interrupt counts as an interruption, not an error.
    #[instrument(
        skip(self, session),
        fields(pod = %session.pod_name, namespace = %session.namespace, context = %session.context)
    )]
    pub fn run(&self, session: &ProxySession) -> Result<Outcome> {
        let mut history = History::default();

        let existing = match self.cluster.get_pod(
            &session.pod_name,
            &session.namespace,
            &session.context,
        ) {
            Ok(existing) => existing,
            // Ctrl-C also stops `kubectl`, so that's probably why it failed.
            Err(err) if (self.interrupted)() => {
                debug!("lookup failed after interrupt: {:#}", err);
                history.enter(SessionState::Interrupted);
                return Ok(Outcome {
                    final_state: history.current(),
                    forward: None,
                    history: history.states,
                });
            }
            Err(err) => {
                return Err(err.context(format!("could not look up pod {}", session.pod_name)))
            }
        };

        let result = match existing {
            Some(status) => {
                info!(phase = %status.phase, "reusing existing pod");
                history.enter(SessionState::Ready);
                self.wait_and_forward(session, false, &mut history)
            }
            None => {
                history.enter(SessionState::Absent);
                history.enter(SessionState::Creating);
                info!(image = %session.image, "creating proxy pod");
                let manifest = proxy_pod_manifest(session)?;
                match self
                    .cluster
                    .apply(&manifest, &session.namespace, &session.context)
                {
                    Ok(()) => self.wait_and_forward(session, true, &mut history),
                    // The manifest may already have reached the API server, so
                    // we still need to clean up.
                    Err(err) if (self.interrupted)() => {
                        debug!("create failed after interrupt: {:#}", err);
                        history.enter(SessionState::Interrupted);
                        Ok(None)
                    }
                    Err(err) => {
                        return Err(
                            err.context(format!("could not create pod {}", session.pod_name))
                        )
                    }
                }
            }
        };
        self.clean_up(session, &mut history);

        let forward = result?;
        Ok(Outcome {
            final_state: history.current(),
            forward,
            history: history.states,
        })
    }

    /// Wait for a pod we just created, then forward to it until the tunnel
    /// closes. Returns `None` if we were interrupted before forwarding.
    fn wait_and_forward(
        &self,
        session: &ProxySession,
        created: bool,
        history: &mut History,
    ) -> Result<Option<ForwardEnd>> {
        if created {
            history.enter(SessionState::WaitingReady);
            match self.wait_until_running(session)? {
                Readiness::Running => history.enter(SessionState::Ready),
                Readiness::TimedOut => {
                    history.enter(SessionState::TimedOut);
                    if self.wait.fail_on_timeout {
                        return Err(format_err!(
                            "pod {} was not running after {} checks",
                            session.pod_name,
                            self.wait.attempts,
                        ));
                    }
                    warn!(
                        "pod {} is not running yet, trying to forward anyway",
                        session.pod_name,
                    );
                }
                Readiness::Interrupted => {
                    history.enter(SessionState::Interrupted);
                    return Ok(None);
                }
            }
        }

        if (self.interrupted)() {
            history.enter(SessionState::Interrupted);
            return Ok(None);
        }

        history.enter(SessionState::Forwarding);
        info!(
            "forwarding localhost:{} to {}:{}, press Ctrl-C to stop",
            session.local_port, session.pod_name, session.pod_port,
        );
        let end = self
            .cluster
            .port_forward(
                &session.pod_name,
                &session.namespace,
                &session.context,
                session.local_port,
                session.pod_port,
            )
            .with_context(|| format!("port-forward to pod {} failed", session.pod_name))?;
        history.enter(match end {
            ForwardEnd::Normal => SessionState::EndedNormally,
            ForwardEnd::Interrupted => SessionState::Interrupted,
        });
        Ok(Some(end))
    }

    /// Poll the pod's status until it's running, we run out of attempts or
    /// we're interrupted.
    fn wait_until_running(&self, session: &ProxySession) -> Result<Readiness> {
        for attempt in 1..=self.wait.attempts {
            if (self.interrupted)() {
                return Ok(Readiness::Interrupted);
            }
            let status = match self.cluster.get_pod(
                &session.pod_name,
                &session.namespace,
                &session.context,
            ) {
                Ok(status) => status,
                Err(err) if (self.interrupted)() => {
                    debug!("status check failed after interrupt: {:#}", err);
                    return Ok(Readiness::Interrupted);
                }
                Err(err) => {
                    return Err(err.context(format!(
                        "could not check status of pod {}",
                        session.pod_name
                    )))
                }
            };
            match status {
                Some(status) if status.is_running() => {
                    debug!(attempt, "pod is running");
                    return Ok(Readiness::Running);
                }
                Some(status) => debug!(attempt, phase = %status.phase, "pod not running yet"),
                None => debug!(attempt, "pod not visible yet"),
            }
            if attempt < self.wait.attempts {
                sleep(self.wait.interval);
            }
        }
        Ok(Readiness::TimedOut)
    }

    /// Delete our pod, unless we were asked to keep it.
    fn clean_up(&self, session: &ProxySession, history: &mut History) {
        if session.skip_cleanup {
            info!("leaving pod {} running", session.pod_name);
            history.enter(SessionState::LeftRunning);
            return;
        }

        info!("deleting pod {}", session.pod_name);
        let deleted = self
            .cluster
            .delete_pod(&session.pod_name, &session.namespace, &session.context)
            .with_context(|| format!("could not delete pod {}", session.pod_name));
        match deleted {
            Ok(()) => history.enter(SessionState::CleanedUp),
            Err(err) => {
                error!("{}", err.display_causes(false));
                history.enter(SessionState::LeftRunning);
            }
        }
    }
}

/// The states a session has passed through.
#[derive(Debug, Default)]
struct History {
    states: Vec<SessionState>,
}

impl History {
    fn enter(&mut self, state: SessionState) {
        debug!(%state, "session state changed");
        self.states.push(state);
    }

    fn current(&self) -> SessionState {
        *self.states.last().unwrap_or(&SessionState::Absent)
    }
}
