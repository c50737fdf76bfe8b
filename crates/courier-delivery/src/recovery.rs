//! One-shot recovery bookkeeping.
//!
//! Each recoverable failure class may be corrected at most once per send.
//! The state is the set of classes already used up; consuming a class twice
//! is an error, which is what stops a flapping failure from looping.

use std::fmt;
use std::marker::PhantomData;

use crate::error::SendError;

pub trait RecoveryReason: Copy + fmt::Debug {
    fn bit(self) -> u8;
    fn name(self) -> &'static str;
}

/// Failure classes corrected by re-running the whole send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OuterRecoveryReason {
    PhoneNumberLookup,
    MultiRecipientSealedSender,
    MismatchedDevices,
    StaleDevices,
}

impl RecoveryReason for OuterRecoveryReason {
    fn bit(self) -> u8 {
        match self {
            Self::PhoneNumberLookup => 1,
            Self::MultiRecipientSealedSender => 1 << 1,
            Self::MismatchedDevices => 1 << 2,
            Self::StaleDevices => 1 << 3,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::PhoneNumberLookup => "phone number lookup",
            Self::MultiRecipientSealedSender => "multi-recipient sealed sender",
            Self::MismatchedDevices => "mismatched devices",
            Self::StaleDevices => "stale devices",
        }
    }
}

/// Failure classes corrected by re-sending to a single recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerRecoveryReason {
    MismatchedDevices,
    StaleDevices,
    Captcha,
}

impl RecoveryReason for InnerRecoveryReason {
    fn bit(self) -> u8 {
        match self {
            Self::MismatchedDevices => 1,
            Self::StaleDevices => 1 << 1,
            Self::Captcha => 1 << 2,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::MismatchedDevices => "mismatched devices",
            Self::StaleDevices => "stale devices",
            Self::Captcha => "spam challenge",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecoveryState<R> {
    exhausted: u8,
    _reason: PhantomData<R>,
}

pub type OuterRecoveryState = RecoveryState<OuterRecoveryReason>;
pub type InnerRecoveryState = RecoveryState<InnerRecoveryReason>;

impl<R: RecoveryReason> RecoveryState<R> {
    pub fn new() -> Self {
        Self {
            exhausted: 0,
            _reason: PhantomData,
        }
    }

    pub fn can(&self, reason: R) -> bool {
        self.exhausted & reason.bit() == 0
    }

    /// Use up `reason`, failing if it was already used.
    pub fn consume(self, reason: R) -> Result<Self, SendError> {
        if !self.can(reason) {
            return Err(SendError::RecoveryExhausted(reason.name()));
        }
        Ok(Self {
            exhausted: self.exhausted | reason.bit(),
            _reason: PhantomData,
        })
    }
}

impl<R: RecoveryReason> Default for RecoveryState<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for RecoveryState<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecoveryState({:#06b})", self.exhausted)
    }
}
