/// How an active procedure call should be canceled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CallCancelMode {
    /// An ERROR is sent immediately back to the caller. The callee receives no INTERRUPT.
    #[default]
    Skip,
    /// INTERRUPT is sent to the callee, and an ERROR is sent back to the caller.
    ///
    /// Callees never acknowledge INTERRUPT, so the dealer treats this like [`Self::KillNoWait`].
    Kill,
    /// INTERRUPT is sent to the callee, and an ERROR is sent immediately back to the caller.
    KillNoWait,
}

impl CallCancelMode {
    /// Checks if the callee should be interrupted.
    pub fn interrupts_callee(&self) -> bool {
        !matches!(self, Self::Skip)
    }
}

impl TryFrom<&str> for CallCancelMode {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "skip" => Ok(Self::Skip),
            "kill" => Ok(Self::Kill),
            "killnowait" => Ok(Self::KillNoWait),
            _ => Err(Self::Error::msg(format!(
                "invalid call cancel mode: {value}"
            ))),
        }
    }
}

impl From<CallCancelMode> for &'static str {
    fn from(value: CallCancelMode) -> Self {
        match value {
            CallCancelMode::Skip => "skip",
            CallCancelMode::Kill => "kill",
            CallCancelMode::KillNoWait => "killnowait",
        }
    }
}
