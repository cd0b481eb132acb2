use crate::correlator::CommandOutcome;
use crate::model::{ConnectionState, Intent, RecordingState};
use crate::session::ObsLink;
use crate::window::WindowSignal;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The signal could not be read; nothing was requested.
    SignalUnavailable,
    Requested {
        intent: Intent,
        outcome: CommandOutcome,
    },
}

/// Level-triggered loop: every tick asks for the recording state the window
/// signal implies and lets the correlator decide whether a command is needed.
pub struct Controller<W> {
    link: ObsLink,
    signal: Arc<Mutex<W>>,
    poll_interval: Duration,
    stop_grace: Duration,
    last_signal: Option<bool>,
}

impl<W: WindowSignal + Send + 'static> Controller<W> {
    pub fn new(link: ObsLink, signal: W, poll_interval: Duration, stop_grace: Duration) -> Self {
        Self {
            link,
            signal: Arc::new(Mutex::new(signal)),
            poll_interval,
            stop_grace,
            last_signal: None,
        }
    }

    pub async fn tick(&mut self) -> TickOutcome {
        let active = match self.read_signal().await {
            Some(active) => active,
            None => return TickOutcome::SignalUnavailable,
        };

        if self.last_signal != Some(active) {
            if active {
                tracing::info!("call window detected");
            } else {
                tracing::info!("no active call window");
            }
            self.last_signal = Some(active);
        }

        let intent = if active { Intent::Start } else { Intent::Stop };
        let outcome = match intent {
            Intent::Start => self.link.request_start(),
            Intent::Stop => self.link.request_stop(),
        };

        match &outcome {
            CommandOutcome::Sent => tracing::info!(intent = %intent, "recording command sent"),
            CommandOutcome::Rejected(err) => {
                tracing::debug!(intent = %intent, error = %err, "recording command not sent, retrying next tick")
            }
            other => tracing::debug!(intent = %intent, outcome = ?other, "no command needed"),
        }

        TickOutcome::Requested { intent, outcome }
    }

    /// Window enumeration may spawn a process, so it runs off the runtime threads.
    async fn read_signal(&self) -> Option<bool> {
        let signal = self.signal.clone();
        let read = tokio::task::spawn_blocking(move || {
            signal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_target_active()
        })
        .await;
        match read {
            Ok(Ok(active)) => Some(active),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "window signal unavailable, keeping current state");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "window signal task failed, keeping current state");
                None
            }
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        // Give the first connection a chance to identify before the first tick.
        tokio::select! {
            _ = self.link.wait_for(self.poll_interval, |s| s.connection == ConnectionState::Ready) => {}
            _ = shutdown.changed() => {}
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Best-effort stop before exit. Returns the outcome when a stop was attempted.
    pub async fn shutdown(&mut self) -> Option<CommandOutcome> {
        if self.link.recording_state() != RecordingState::Recording {
            return None;
        }
        tracing::info!("stopping recording before exit");
        let outcome = self.link.request_stop();
        match &outcome {
            CommandOutcome::Sent | CommandOutcome::AlreadyPending => {
                let confirmed = self
                    .link
                    .wait_for(self.stop_grace, |s| s.recording == RecordingState::Idle)
                    .await;
                if !confirmed {
                    tracing::warn!(grace = ?self.stop_grace, "stop not confirmed before exit");
                }
            }
            CommandOutcome::Rejected(err) => {
                tracing::warn!(error = %err, "could not stop recording before exit")
            }
            other => tracing::debug!(outcome = ?other, "no stop needed"),
        }
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CommandRejected, LinkOptions};
    use crate::testing::{attach_fake_obs, connected_link, FakeObsBehaviour};
    use crate::window::SignalError;
    use std::collections::VecDeque;

    const WAIT: Duration = Duration::from_secs(2);

    /// Replays a fixed sequence, then keeps returning the last value.
    struct ScriptedSignal {
        script: VecDeque<Result<bool, &'static str>>,
        last: bool,
    }

    impl ScriptedSignal {
        fn new(script: &[Result<bool, &'static str>]) -> Self {
            Self {
                script: script.iter().cloned().collect(),
                last: false,
            }
        }
    }

    impl WindowSignal for ScriptedSignal {
        fn is_target_active(&mut self) -> Result<bool, SignalError> {
            match self.script.pop_front() {
                Some(Ok(active)) => {
                    self.last = active;
                    Ok(active)
                }
                Some(Err(msg)) => Err(SignalError::Enumerate(msg.to_string())),
                None => Ok(self.last),
            }
        }
    }

    fn options() -> LinkOptions {
        LinkOptions {
            command_timeout: Duration::from_secs(10),
            identify_timeout: Duration::from_secs(5),
            sync_record_status: false,
        }
    }

    fn controller(link: &ObsLink, script: &[Result<bool, &'static str>]) -> Controller<ScriptedSignal> {
        Controller::new(
            link.clone(),
            ScriptedSignal::new(script),
            Duration::from_millis(20),
            WAIT,
        )
    }

    async fn settle(link: &ObsLink) {
        assert!(link.wait_for(WAIT, |s| s.pending.is_none()).await);
    }

    fn outcome(tick: TickOutcome) -> CommandOutcome {
        match tick {
            TickOutcome::Requested { outcome, .. } => outcome,
            TickOutcome::SignalUnavailable => panic!("signal unexpectedly unavailable"),
        }
    }

    #[tokio::test]
    async fn one_start_and_one_stop_per_transition() {
        let (link, fake, _task) = connected_link(options(), FakeObsBehaviour::default()).await;
        let mut ctl = controller(&link, &[Ok(true), Ok(true), Ok(false), Ok(false)]);

        assert_eq!(outcome(ctl.tick().await), CommandOutcome::Sent);
        settle(&link).await;
        assert_eq!(outcome(ctl.tick().await), CommandOutcome::AlreadySatisfied);
        assert_eq!(outcome(ctl.tick().await), CommandOutcome::Sent);
        settle(&link).await;
        assert_eq!(outcome(ctl.tick().await), CommandOutcome::AlreadySatisfied);

        assert_eq!(fake.requests_of("StartRecording"), 1);
        assert_eq!(fake.requests_of("StopRecording"), 1);
        assert_eq!(link.recording_state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn unacknowledged_start_is_not_repeated() {
        let behaviour = FakeObsBehaviour {
            ack_requests: false,
            ..Default::default()
        };
        let (link, fake, _task) = connected_link(options(), behaviour).await;
        let mut ctl = controller(&link, &[Ok(true), Ok(true), Ok(true)]);

        assert_eq!(outcome(ctl.tick().await), CommandOutcome::Sent);
        assert_eq!(outcome(ctl.tick().await), CommandOutcome::AlreadyPending);
        assert_eq!(outcome(ctl.tick().await), CommandOutcome::AlreadyPending);

        assert!(fake.wait_for_requests("StartRecording", 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fake.requests_of("StartRecording"), 1);
        assert_eq!(link.recording_state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn lost_acknowledgment_is_retried_after_command_timeout() {
        let behaviour = FakeObsBehaviour {
            ack_requests: false,
            ..Default::default()
        };
        let opts = LinkOptions {
            command_timeout: Duration::from_millis(50),
            ..options()
        };
        let (link, fake, _task) = connected_link(opts, behaviour).await;
        let mut ctl = controller(&link, &[Ok(true)]);

        assert_eq!(outcome(ctl.tick().await), CommandOutcome::Sent);
        assert!(fake.wait_for_requests("StartRecording", 1).await);
        fake.set_acks(true);
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(outcome(ctl.tick().await), CommandOutcome::Sent);
        assert!(
            link.wait_for(WAIT, |s| s.recording == RecordingState::Recording)
                .await
        );
        assert_eq!(fake.requests_of("StartRecording"), 2);
    }

    #[tokio::test]
    async fn signal_failure_does_not_force_a_stop() {
        let (link, fake, _task) = connected_link(options(), FakeObsBehaviour::default()).await;
        let mut ctl = controller(&link, &[Ok(true), Err("enumeration failed")]);

        ctl.tick().await;
        settle(&link).await;
        assert_eq!(ctl.tick().await, TickOutcome::SignalUnavailable);

        assert_eq!(link.recording_state(), RecordingState::Recording);
        assert_eq!(fake.requests_of("StopRecording"), 0);
    }

    struct ThreadRecordingSignal {
        seen_on: Arc<Mutex<Option<std::thread::ThreadId>>>,
    }

    impl WindowSignal for ThreadRecordingSignal {
        fn is_target_active(&mut self) -> Result<bool, SignalError> {
            *self.seen_on.lock().unwrap() = Some(std::thread::current().id());
            Ok(false)
        }
    }

    #[tokio::test]
    async fn signal_is_read_off_the_runtime_thread() {
        let link = ObsLink::new(options());
        let seen_on = Arc::new(Mutex::new(None));
        let signal = ThreadRecordingSignal {
            seen_on: seen_on.clone(),
        };
        let mut ctl = Controller::new(link, signal, Duration::from_millis(20), WAIT);

        ctl.tick().await;
        let reader = seen_on.lock().unwrap().expect("signal was read");
        assert_ne!(reader, std::thread::current().id());
    }

    #[tokio::test]
    async fn ticks_while_disconnected_are_rejected() {
        let link = ObsLink::new(options());
        let mut ctl = controller(&link, &[Ok(true)]);
        assert_eq!(
            outcome(ctl.tick().await),
            CommandOutcome::Rejected(CommandRejected::NotReady(ConnectionState::Disconnected))
        );
        assert_eq!(link.status().pending, None);
    }

    #[tokio::test]
    async fn reconnect_after_drop_with_pending_start_reissues_start() {
        let behaviour = FakeObsBehaviour {
            ack_requests: false,
            ..Default::default()
        };
        let (link, first, _task) = connected_link(options(), behaviour).await;
        let mut ctl = controller(&link, &[Ok(true)]);

        assert_eq!(outcome(ctl.tick().await), CommandOutcome::Sent);
        assert!(first.wait_for_requests("StartRecording", 1).await);
        first.drop_connection();
        assert!(
            link.wait_for(WAIT, |s| s.connection == ConnectionState::Closed)
                .await
        );
        assert_eq!(link.recording_state(), RecordingState::Idle);

        let (second, _task) = attach_fake_obs(&link, FakeObsBehaviour::default()).await;
        assert!(
            link.wait_for(WAIT, |s| s.connection == ConnectionState::Ready)
                .await
        );
        assert_eq!(link.recording_state(), RecordingState::Idle);

        assert_eq!(outcome(ctl.tick().await), CommandOutcome::Sent);
        assert!(
            link.wait_for(WAIT, |s| s.recording == RecordingState::Recording)
                .await
        );
        assert_eq!(second.requests_of("StartRecording"), 1);
    }

    #[tokio::test]
    async fn shutdown_while_recording_sends_exactly_one_stop() {
        let (link, fake, _task) = connected_link(options(), FakeObsBehaviour::default()).await;
        let mut ctl = controller(&link, &[Ok(true)]);
        ctl.tick().await;
        settle(&link).await;

        assert_eq!(ctl.shutdown().await, Some(CommandOutcome::Sent));
        assert_eq!(link.recording_state(), RecordingState::Idle);
        assert_eq!(fake.requests_of("StopRecording"), 1);
    }

    #[tokio::test]
    async fn shutdown_while_idle_sends_nothing() {
        let (link, fake, _task) = connected_link(options(), FakeObsBehaviour::default()).await;
        let mut ctl = controller(&link, &[]);
        assert_eq!(ctl.shutdown().await, None);
        assert!(fake.requests().is_empty());
    }

    #[tokio::test]
    async fn run_loop_records_then_stops_on_shutdown() {
        let (link, fake, _task) = connected_link(options(), FakeObsBehaviour::default()).await;
        let ctl = controller(&link, &[Ok(true)]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(ctl.run(shutdown_rx));

        assert!(
            link.wait_for(WAIT, |s| s.recording == RecordingState::Recording)
                .await
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();

        assert_eq!(fake.requests_of("StartRecording"), 1);
        assert_eq!(fake.requests_of("StopRecording"), 1);
        assert_eq!(link.recording_state(), RecordingState::Idle);
    }
}
