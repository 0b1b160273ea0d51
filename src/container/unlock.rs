//! Interactive wallet unlock over a container's stdio.
//!
//! With the `file` keyring backend the node prompts for its passphrase on
//! every start. The passphrase is fed through a live attach session so it is
//! never written to disk, the image, or the container environment.
//!
//! ```text
//! Attaching ──secret written──► AwaitingOutcome ──failure phrase──► Rejected
//!     │                              │   └────────success marker──► Accepted
//!     └──────────────┬───────────────┘
//!                    └──start failed / stream closed / timeout───► Failed
//! ```
//!
//! Terminal states ignore every further event, so a session resolves once.

use std::sync::Arc;
use std::time::Duration;

use statig::prelude::*;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::container::runtime::{AttachSession, ContainerRuntime};
use crate::error::{NodeError, Result};
use crate::node::Passphrase;

// ---------------------------------------------------------------------------
// Output classification
// ---------------------------------------------------------------------------

/// Lower-case phrases the node prints when it refuses the passphrase.
pub const PASSPHRASE_FAILURE_PHRASES: &[&str] = &[
    "incorrect passphrase",
    "too many failed passphrase attempts",
    "password must be at least 8 characters",
    "ciphertext decryption failed",
];

/// Printed by the node once the keyring is unlocked and startup continues.
pub const UNLOCK_SUCCESS_MARKER: &str = "starting the node";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Rejected(&'static str),
    Accepted,
    Pending,
}

/// Classify one piece of output. Failure phrases win over the success marker.
pub fn classify(text: &str) -> Classification {
    let lower = text.to_lowercase();
    if let Some(phrase) = PASSPHRASE_FAILURE_PHRASES
        .iter()
        .find(|p| lower.contains(*p))
    {
        return Classification::Rejected(phrase);
    }
    if lower.contains(UNLOCK_SUCCESS_MARKER) {
        return Classification::Accepted;
    }
    Classification::Pending
}

/// Classifier over a chunked stream. Keeps a short tail of the previous
/// chunk so a phrase split across two reads is still recognised.
#[derive(Debug, Default)]
pub struct StreamClassifier {
    tail: String,
}

impl StreamClassifier {
    fn window() -> usize {
        PASSPHRASE_FAILURE_PHRASES
            .iter()
            .chain(std::iter::once(&UNLOCK_SUCCESS_MARKER))
            .map(|p| p.len())
            .max()
            .unwrap_or(0)
    }

    pub fn feed(&mut self, chunk: &str) -> Classification {
        let mut text = std::mem::take(&mut self.tail);
        text.push_str(chunk);
        let result = classify(&text);

        let keep = Self::window().saturating_sub(1);
        let cut = text
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| text.len() - i <= keep)
            .unwrap_or(text.len());
        self.tail = text[cut..].to_string();
        result
    }
}

// ---------------------------------------------------------------------------
// Events and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum UnlockEvent {
    /// Passphrase and newline written to stdin.
    SecretWritten,
    /// Writing to stdin failed.
    WriteFailed(String),
    /// A chunk of container output.
    Output(String),
    /// The concurrent container start reported failure.
    StartFailed(String),
    /// The attach stream ended.
    StreamClosed,
    /// No terminal state within the unlock timeout.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockFailure {
    Write(String),
    Start(String),
    StreamClosed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    Accepted,
    Rejected(String),
    Failed(UnlockFailure),
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Shared storage for one unlock session.
pub struct UnlockMachine {
    pub container: String,
    classifier: StreamClassifier,
}

impl UnlockMachine {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            classifier: StreamClassifier::default(),
        }
    }

    /// The resolved outcome, once a terminal state is reached.
    pub fn outcome(state: &State) -> Option<UnlockOutcome> {
        match state {
            State::Accepted {} => Some(UnlockOutcome::Accepted),
            State::Rejected { phrase } => Some(UnlockOutcome::Rejected(phrase.clone())),
            State::Failed { failure } => Some(UnlockOutcome::Failed(failure.clone())),
            State::Attaching {} | State::AwaitingOutcome {} => None,
        }
    }
}

#[state_machine(
    initial = "State::attaching()",
    state(derive(Debug, Clone, PartialEq))
)]
impl UnlockMachine {
    /// Attached; nothing may be read before the secret is written.
    #[state]
    fn attaching(&mut self, event: &UnlockEvent) -> Outcome<State> {
        match event {
            UnlockEvent::SecretWritten => Transition(State::awaiting_outcome()),
            UnlockEvent::WriteFailed(msg) => {
                Transition(State::failed(UnlockFailure::Write(msg.clone())))
            }
            UnlockEvent::StartFailed(msg) => {
                Transition(State::failed(UnlockFailure::Start(msg.clone())))
            }
            UnlockEvent::StreamClosed => Transition(State::failed(UnlockFailure::StreamClosed)),
            UnlockEvent::TimedOut => Transition(State::failed(UnlockFailure::TimedOut)),
            UnlockEvent::Output(_) => Handled,
        }
    }

    #[state(entry_action = "enter_awaiting_outcome")]
    fn awaiting_outcome(&mut self, event: &UnlockEvent) -> Outcome<State> {
        match event {
            UnlockEvent::Output(chunk) => match self.classifier.feed(chunk) {
                Classification::Rejected(phrase) => {
                    Transition(State::rejected(phrase.to_string()))
                }
                Classification::Accepted => Transition(State::accepted()),
                Classification::Pending => Handled,
            },
            UnlockEvent::StartFailed(msg) => {
                Transition(State::failed(UnlockFailure::Start(msg.clone())))
            }
            UnlockEvent::StreamClosed => Transition(State::failed(UnlockFailure::StreamClosed)),
            UnlockEvent::TimedOut => Transition(State::failed(UnlockFailure::TimedOut)),
            UnlockEvent::SecretWritten | UnlockEvent::WriteFailed(_) => Handled,
        }
    }

    #[state]
    fn accepted(&mut self, event: &UnlockEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn rejected(&mut self, event: &UnlockEvent, phrase: &String) -> Outcome<State> {
        let _ = (event, phrase);
        Handled
    }

    #[state]
    fn failed(&mut self, event: &UnlockEvent, failure: &UnlockFailure) -> Outcome<State> {
        let _ = (event, failure);
        Handled
    }

    #[action]
    fn enter_awaiting_outcome(&mut self) {
        debug!(container = %self.container, "passphrase written, awaiting unlock outcome");
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Drive one attach session to a terminal outcome.
///
/// The secret is written before the first output read so a process blocked
/// on its prompt cannot deadlock behind unread output.
pub async fn drive(
    mut session: AttachSession,
    container: &str,
    secret: &Passphrase,
    timeout: Duration,
) -> UnlockOutcome {
    let mut machine = UnlockMachine::new(container).state_machine();

    let mut line = Zeroizing::new(String::with_capacity(secret.len() + 1));
    line.push_str(secret.expose());
    line.push('\n');
    let written = async {
        session.stdin.write_all(line.as_bytes()).await?;
        session.stdin.flush().await
    }
    .await;
    drop(line);
    match written {
        Ok(()) => machine.handle(&UnlockEvent::SecretWritten),
        Err(e) => machine.handle(&UnlockEvent::WriteFailed(e.to_string())),
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut start_pending = true;

    loop {
        if let Some(outcome) = UnlockMachine::outcome(machine.state()) {
            session.close();
            return outcome;
        }

        tokio::select! {
            biased;

            chunk = session.output.recv() => match chunk {
                Some(chunk) => machine.handle(&UnlockEvent::Output(chunk)),
                // A start failure is reported alongside the stream closing.
                None if start_pending => match session.started.try_recv() {
                    Ok(Err(e)) => machine.handle(&UnlockEvent::StartFailed(e.to_string())),
                    _ => machine.handle(&UnlockEvent::StreamClosed),
                },
                None => machine.handle(&UnlockEvent::StreamClosed),
            },

            started = &mut session.started, if start_pending => {
                start_pending = false;
                if let Ok(Err(e)) = started {
                    machine.handle(&UnlockEvent::StartFailed(e.to_string()));
                }
            }

            _ = &mut deadline => machine.handle(&UnlockEvent::TimedOut),
        }
    }
}

/// One interactive start: attach, feed the passphrase, classify, resolve.
pub struct SecretInjectionChannel {
    runtime: Arc<dyn ContainerRuntime>,
    container: String,
    secret: Passphrase,
    timeout: Duration,
}

impl SecretInjectionChannel {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        container: impl Into<String>,
        secret: Passphrase,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            container: container.into(),
            secret,
            timeout,
        }
    }

    /// `Ok` only when the node reported a successful unlock. A rejected
    /// passphrase or a timeout stops the container before returning.
    pub async fn run(self) -> Result<()> {
        let session = self.runtime.start_attached(&self.container).await?;
        info!(container = %self.container, "attached, feeding wallet passphrase");

        match drive(session, &self.container, &self.secret, self.timeout).await {
            UnlockOutcome::Accepted => {
                info!(container = %self.container, "wallet unlocked, node starting");
                Ok(())
            }
            UnlockOutcome::Rejected(phrase) => {
                warn!(container = %self.container, reason = %phrase, "wallet passphrase rejected");
                self.stop_container().await;
                Err(NodeError::SecretRejected(phrase))
            }
            UnlockOutcome::Failed(UnlockFailure::TimedOut) => {
                let secs = self.timeout.as_secs();
                error!(container = %self.container, timeout_secs = secs, "unlock timed out");
                self.stop_container().await;
                Err(NodeError::Timeout(secs))
            }
            UnlockOutcome::Failed(UnlockFailure::Start(msg)) => Err(NodeError::Runtime {
                command: "start".to_string(),
                stderr: msg,
            }),
            UnlockOutcome::Failed(UnlockFailure::Write(msg)) => {
                self.stop_container().await;
                Err(NodeError::Attach(format!("writing passphrase: {msg}")))
            }
            UnlockOutcome::Failed(UnlockFailure::StreamClosed) => Err(NodeError::Attach(
                "container output ended before unlock completed".to_string(),
            )),
        }
    }

    async fn stop_container(&self) {
        if let Err(e) = self.runtime.stop(&self.container).await {
            warn!(container = %self.container, error = %e, "failed to stop container after unlock failure");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::mock::{MockRuntime, RuntimeCall};

    const NAME: &str = "sentinel-dvpn-node";

    #[test]
    fn every_failure_phrase_rejects_in_any_case() {
        for phrase in PASSPHRASE_FAILURE_PHRASES {
            for variant in [
                phrase.to_string(),
                phrase.to_uppercase(),
                format!("Error: {}!", capitalize(phrase)),
            ] {
                assert_eq!(
                    classify(&variant),
                    Classification::Rejected(*phrase),
                    "{variant:?} must be rejected"
                );
            }
        }
    }

    fn capitalize(s: &str) -> String {
        let mut chars = s.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    #[test]
    fn success_marker_accepts() {
        assert_eq!(classify("INFO Starting the node ..."), Classification::Accepted);
    }

    #[test]
    fn unrelated_output_stays_pending() {
        assert_eq!(classify("Enter keyring passphrase:"), Classification::Pending);
        assert_eq!(classify(""), Classification::Pending);
    }

    #[test]
    fn failure_wins_over_success_in_same_chunk() {
        assert!(matches!(
            classify("starting the node\nincorrect passphrase"),
            Classification::Rejected(_)
        ));
    }

    #[test]
    fn stream_classifier_joins_split_phrases() {
        let mut c = StreamClassifier::default();
        assert_eq!(c.feed("Error: incorrect pass"), Classification::Pending);
        assert_eq!(
            c.feed("phrase\n"),
            Classification::Rejected("incorrect passphrase")
        );
    }

    #[test]
    fn stream_classifier_handles_multibyte_output() {
        let mut c = StreamClassifier::default();
        assert_eq!(c.feed("ノードを起動しています…"), Classification::Pending);
        assert_eq!(c.feed(" starting the node"), Classification::Accepted);
    }

    #[test]
    fn machine_ignores_output_before_secret_written() {
        let mut sm = UnlockMachine::new(NAME).state_machine();
        sm.handle(&UnlockEvent::Output("starting the node".into()));
        assert_eq!(UnlockMachine::outcome(sm.state()), None);
        sm.handle(&UnlockEvent::SecretWritten);
        sm.handle(&UnlockEvent::Output("starting the node".into()));
        assert_eq!(UnlockMachine::outcome(sm.state()), Some(UnlockOutcome::Accepted));
    }

    #[test]
    fn terminal_states_are_one_shot() {
        let mut sm = UnlockMachine::new(NAME).state_machine();
        sm.handle(&UnlockEvent::SecretWritten);
        sm.handle(&UnlockEvent::Output("incorrect passphrase".into()));
        let first = UnlockMachine::outcome(sm.state());
        sm.handle(&UnlockEvent::Output("starting the node".into()));
        sm.handle(&UnlockEvent::TimedOut);
        assert_eq!(UnlockMachine::outcome(sm.state()), first);
        assert_eq!(
            first,
            Some(UnlockOutcome::Rejected("incorrect passphrase".into()))
        );
    }

    #[tokio::test]
    async fn accepted_when_marker_follows_prompt() {
        let runtime = Arc::new(MockRuntime::new().with_container(NAME, "created"));
        runtime.script_attach(&["Enter keyring passphrase:", "INFO Starting the node"]);

        let channel = SecretInjectionChannel::new(
            runtime.clone(),
            NAME,
            Passphrase::new("correct-horse"),
            Duration::from_secs(5),
        );
        channel.run().await.expect("unlock should succeed");

        assert_eq!(runtime.stdin_written(), "correct-horse\n");
        assert_eq!(runtime.container_state(NAME).as_deref(), Some("running"));
        assert!(!runtime.calls().contains(&RuntimeCall::Stop(NAME.into())));
    }

    #[tokio::test]
    async fn rejected_passphrase_stops_container() {
        let runtime = Arc::new(MockRuntime::new().with_container(NAME, "created"));
        runtime.script_attach(&["Enter keyring passphrase:", "Error: incorrect passphrase"]);

        let err = SecretInjectionChannel::new(
            runtime.clone(),
            NAME,
            Passphrase::new("wrong-horse"),
            Duration::from_secs(5),
        )
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, NodeError::SecretRejected(_)));
        assert!(runtime.calls().contains(&RuntimeCall::Stop(NAME.into())));
        assert_eq!(runtime.container_state(NAME).as_deref(), Some("exited"));
    }

    #[tokio::test]
    async fn start_failure_is_error() {
        let runtime = Arc::new(MockRuntime::new().with_container(NAME, "created"));
        runtime.fail_attached_start("port is already allocated");

        let err = SecretInjectionChannel::new(
            runtime.clone(),
            NAME,
            Passphrase::new("correct-horse"),
            Duration::from_secs(5),
        )
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, NodeError::Runtime { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn silent_container_times_out_and_is_stopped() {
        let runtime = Arc::new(MockRuntime::new().with_container(NAME, "created"));
        runtime.script_attach(&["Enter keyring passphrase:"]);

        let err = SecretInjectionChannel::new(
            runtime.clone(),
            NAME,
            Passphrase::new("correct-horse"),
            Duration::from_millis(100),
        )
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, NodeError::Timeout(_)));
        assert!(runtime.calls().contains(&RuntimeCall::Stop(NAME.into())));
    }

    #[tokio::test]
    async fn stream_ending_without_outcome_is_error() {
        let runtime = Arc::new(MockRuntime::new().with_container(NAME, "created"));
        runtime.script_attach(&["Enter keyring passphrase:"]);
        runtime.close_stream_after_output();

        let err = SecretInjectionChannel::new(
            runtime.clone(),
            NAME,
            Passphrase::new("correct-horse"),
            Duration::from_secs(5),
        )
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, NodeError::Attach(_)), "got {err:?}");
    }
}
