//! ALFA Token Seal - Biometric Gate
//!
//! Runs one biometric challenge at a time and releases an authorized cipher
//! session to the caller's continuation only after the enclave accepts the
//! sensor's token.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::crypto::{AuthToken, SealKey};
use crate::error::{SealError, SealResult};
use crate::session::{AuthorizedSession, CipherSession};

/// Result of the platform capability query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BiometricCapability {
    Available,
    NotEnrolled,
    HardwareUnavailable,
}

/// Why a biometric challenge failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Biometric did not match
    NotRecognized,
    /// Too many attempts; sensor temporarily locked
    Lockout,
    /// Sensor locked until the device credential is used
    LockoutPermanent,
    /// Token was issued for another challenge
    StaleToken,
    /// Platform-reported error
    Hardware(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NotRecognized => f.write_str("biometric not recognized"),
            FailureReason::Lockout => f.write_str("too many attempts, try again later"),
            FailureReason::LockoutPermanent => f.write_str("sensor locked, device credential required"),
            FailureReason::StaleToken => f.write_str("token does not match this challenge"),
            FailureReason::Hardware(msg) => write!(f, "hardware error: {}", msg),
        }
    }
}

/// Text shown on the system prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptInfo {
    pub title: String,
    pub subtitle: String,
    pub negative_button: String,
}

impl Default for PromptInfo {
    fn default() -> Self {
        Self {
            title: "Biometric login".into(),
            subtitle: "Log in using your biometric credential".into(),
            negative_button: "Use account password".into(),
        }
    }
}

/// Request handed to the platform prompt
#[derive(Debug, Clone)]
pub struct PromptRequest {
    /// Enclave operation challenge the sensor must sign
    pub challenge: u64,
    pub info: PromptInfo,
}

/// What the platform prompt reports back
#[derive(Debug, Clone)]
pub enum PromptResult {
    Authenticated(AuthToken),
    Cancelled,
    Failed(FailureReason),
}

/// Platform biometric service
pub trait BiometricAuthenticator: Send + Sync {
    fn capability(&self) -> BiometricCapability;

    /// Show the prompt. The result arrives on the returned channel; a dropped
    /// sender counts as a dismissal.
    fn present(&self, request: PromptRequest) -> oneshot::Receiver<PromptResult>;
}

// ═══════════════════════════════════════════════════════════════════════════
// GATE
// ═══════════════════════════════════════════════════════════════════════════

/// Gate state. Everything but `Idle` and `Prompting` is the terminal state of
/// the most recent challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Prompting,
    Authorized,
    Cancelled,
    Failed,
    NotEnrolled,
}

/// Completion of a gated operation. Cancellation is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T> {
    Completed(T),
    Cancelled,
}

impl<T> Completion<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Completion::Cancelled)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Completion::Completed(value) => Some(value),
            Completion::Cancelled => None,
        }
    }
}

/// Single-challenge biometric gate
pub struct BiometricGate {
    authenticator: Arc<dyn BiometricAuthenticator>,
    prompt: PromptInfo,
    state: Mutex<GateState>,
}

impl BiometricGate {
    pub fn new(authenticator: Arc<dyn BiometricAuthenticator>, prompt: PromptInfo) -> Self {
        Self {
            authenticator,
            prompt,
            state: Mutex::new(GateState::Idle),
        }
    }

    pub fn state(&self) -> GateState {
        *self.state.lock()
    }

    pub fn capability(&self) -> BiometricCapability {
        self.authenticator.capability()
    }

    /// Start a challenge for `session`. Fails fast without prompting when
    /// biometrics are not enrolled or another challenge is outstanding.
    pub fn begin(&self, session: CipherSession) -> SealResult<PendingChallenge<'_>> {
        {
            let mut state = self.state.lock();
            if *state == GateState::Prompting {
                return Err(SealError::ChallengeInProgress);
            }

            let capability = self.authenticator.capability();
            if capability != BiometricCapability::Available {
                log::warn!("Biometric prompt unavailable: {:?}", capability);
                *state = GateState::NotEnrolled;
                return Err(SealError::NotEnrolled);
            }

            *state = GateState::Prompting;
        }

        let request = PromptRequest {
            challenge: session.challenge(),
            info: self.prompt.clone(),
        };
        log::debug!("Presenting biometric prompt for '{}'", session.key_name());
        let receiver = self.authenticator.present(request);

        Ok(PendingChallenge {
            session,
            receiver,
            guard: PromptGuard { gate: self, settled: false },
        })
    }

    /// `begin` followed by `complete`
    pub async fn authenticate<T, F>(&self, session: CipherSession, on_success: F) -> SealResult<Completion<T>>
    where
        F: FnOnce(AuthorizedSession) -> SealResult<T>,
    {
        self.begin(session)?.complete(on_success).await
    }
}

/// Resets the gate if a challenge is abandoned mid-prompt
struct PromptGuard<'a> {
    gate: &'a BiometricGate,
    settled: bool,
}

impl PromptGuard<'_> {
    fn settle(&mut self, state: GateState) {
        *self.gate.state.lock() = state;
        self.settled = true;
    }
}

impl Drop for PromptGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            *self.gate.state.lock() = GateState::Cancelled;
        }
    }
}

/// A challenge that is on screen and awaiting the user
pub struct PendingChallenge<'a> {
    session: CipherSession,
    receiver: oneshot::Receiver<PromptResult>,
    guard: PromptGuard<'a>,
}

impl PendingChallenge<'_> {
    pub fn challenge(&self) -> u64 {
        self.session.challenge()
    }

    /// Wait for the user. `on_success` runs exactly once, and only when the
    /// enclave has accepted the sensor's token.
    pub async fn complete<T, F>(self, on_success: F) -> SealResult<Completion<T>>
    where
        F: FnOnce(AuthorizedSession) -> SealResult<T>,
    {
        let PendingChallenge { session, receiver, mut guard } = self;

        let result = receiver.await.unwrap_or(PromptResult::Cancelled);

        match result {
            PromptResult::Authenticated(token) => {
                if token.challenge != session.challenge() {
                    guard.settle(GateState::Failed);
                    return Err(SealError::BiometricFailed(FailureReason::StaleToken));
                }

                match session.authorize(&token) {
                    Ok(authorized) => {
                        guard.settle(GateState::Authorized);
                        log::debug!("Biometric challenge authorized");
                        on_success(authorized).map(Completion::Completed)
                    }
                    Err(e) => {
                        guard.settle(GateState::Failed);
                        log::warn!("Enclave rejected biometric token: {}", e);
                        Err(e)
                    }
                }
            }
            PromptResult::Cancelled => {
                guard.settle(GateState::Cancelled);
                log::info!("Biometric prompt dismissed");
                Ok(Completion::Cancelled)
            }
            PromptResult::Failed(reason) => {
                guard.settle(GateState::Failed);
                log::warn!("Biometric challenge failed: {}", reason);
                Err(SealError::BiometricFailed(reason))
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SOFTWARE SENSOR
// ═══════════════════════════════════════════════════════════════════════════

/// Scripted reaction of the software sensor to the next prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorScript {
    /// Finger matches; a token for the prompt's challenge is issued
    Match,
    /// Finger matches, but the token is signed for a different challenge
    MatchStale,
    /// Sensor reports a failure
    Reject(FailureReason),
    /// User dismisses the prompt
    Dismiss,
    /// Prompt stays on screen until `release_held` is called
    Hold,
}

/// Sensor lockout policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorPolicy {
    /// Lock after this many unrecognized attempts
    pub max_attempts: u8,
    /// Cooldown period after lockout (seconds)
    pub lockout_duration: u64,
}

impl Default for SensorPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout_duration: 30,
        }
    }
}

struct SensorState {
    capability: BiometricCapability,
    script: VecDeque<SensorScript>,
    held: VecDeque<(PromptRequest, oneshot::Sender<PromptResult>)>,
    failed_attempts: u8,
    locked_until: Option<DateTime<Utc>>,
}

/// Software biometric sensor for desktop builds and tests.
///
/// Shares a pairing key with the enclave, so the tokens it issues are
/// accepted. With an empty script every prompt matches.
pub struct SoftwareSensor {
    pairing_key: SealKey,
    authenticator_id: u64,
    policy: SensorPolicy,
    state: Mutex<SensorState>,
    prompts: AtomicUsize,
}

impl SoftwareSensor {
    pub fn new(pairing_key: SealKey) -> Self {
        Self::with_policy(pairing_key, SensorPolicy::default())
    }

    pub fn with_policy(pairing_key: SealKey, policy: SensorPolicy) -> Self {
        use rand::RngCore;
        Self {
            pairing_key,
            authenticator_id: rand::thread_rng().next_u64(),
            policy,
            state: Mutex::new(SensorState {
                capability: BiometricCapability::Available,
                script: VecDeque::new(),
                held: VecDeque::new(),
                failed_attempts: 0,
                locked_until: None,
            }),
            prompts: AtomicUsize::new(0),
        }
    }

    pub fn set_capability(&self, capability: BiometricCapability) {
        self.state.lock().capability = capability;
    }

    /// Queue reactions for upcoming prompts
    pub fn script(&self, steps: impl IntoIterator<Item = SensorScript>) {
        self.state.lock().script.extend(steps);
    }

    /// Number of prompts shown so far
    pub fn prompts_shown(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    /// Number of prompts currently held on screen
    pub fn held_prompts(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Resolve the oldest held prompt. Returns false if none is held.
    pub fn release_held(&self, step: SensorScript) -> bool {
        let mut state = self.state.lock();
        match state.held.pop_front() {
            Some((request, sender)) => {
                let result = self.react(&mut state, &request, step);
                if let Some(result) = result {
                    let _ = sender.send(result);
                }
                true
            }
            None => false,
        }
    }

    /// Check if locked out
    pub fn is_locked(&self) -> bool {
        Self::locked(&self.state.lock())
    }

    fn locked(state: &SensorState) -> bool {
        state.locked_until.map(|until| Utc::now() < until).unwrap_or(false)
    }

    /// Apply one scripted step. `None` means the prompt stays open.
    fn react(&self, state: &mut SensorState, request: &PromptRequest, step: SensorScript) -> Option<PromptResult> {
        // An expired lockout starts a fresh attempt count
        if state.locked_until.is_some() && !Self::locked(state) {
            state.locked_until = None;
            state.failed_attempts = 0;
        }

        if Self::locked(state) && step != SensorScript::Dismiss {
            return Some(PromptResult::Failed(FailureReason::Lockout));
        }

        match step {
            SensorScript::Match => {
                state.failed_attempts = 0;
                state.locked_until = None;
                Some(PromptResult::Authenticated(AuthToken::issue(
                    &self.pairing_key,
                    request.challenge,
                    self.authenticator_id,
                )))
            }
            SensorScript::MatchStale => Some(PromptResult::Authenticated(AuthToken::issue(
                &self.pairing_key,
                request.challenge.wrapping_add(1),
                self.authenticator_id,
            ))),
            SensorScript::Reject(FailureReason::NotRecognized) => {
                state.failed_attempts = state.failed_attempts.saturating_add(1);
                if state.failed_attempts >= self.policy.max_attempts {
                    state.locked_until =
                        Some(Utc::now() + chrono::Duration::seconds(self.policy.lockout_duration as i64));
                    Some(PromptResult::Failed(FailureReason::Lockout))
                } else {
                    Some(PromptResult::Failed(FailureReason::NotRecognized))
                }
            }
            SensorScript::Reject(reason) => Some(PromptResult::Failed(reason)),
            SensorScript::Dismiss => Some(PromptResult::Cancelled),
            SensorScript::Hold => None,
        }
    }
}

impl BiometricAuthenticator for SoftwareSensor {
    fn capability(&self) -> BiometricCapability {
        self.state.lock().capability
    }

    fn present(&self, request: PromptRequest) -> oneshot::Receiver<PromptResult> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();

        let mut state = self.state.lock();
        let step = state.script.pop_front().unwrap_or(SensorScript::Match);
        match self.react(&mut state, &request, step) {
            Some(result) => {
                let _ = sender.send(result);
            }
            None => state.held.push_back((request, sender)),
        }

        receiver
    }
}
