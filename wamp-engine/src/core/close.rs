use crate::core::uri::Uri;

/// The reason for closing a WAMP session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    #[default]
    Normal,
    SystemShutdown,
    CloseRealm,
    Killed,
    TimedOut,
    GoodbyeAndOut,
}

impl CloseReason {
    fn uri_component(&self) -> &str {
        match self {
            Self::Normal => "normal",
            Self::SystemShutdown => "system_shutdown",
            Self::CloseRealm => "close_realm",
            Self::Killed => "killed",
            Self::TimedOut => "timed_out",
            Self::GoodbyeAndOut => "goodbye_and_out",
        }
    }

    /// URI for the close reason.
    pub fn uri(&self) -> Uri {
        Uri::from_known(format!("wamp.close.{}", self.uri_component()))
    }
}

impl TryFrom<&Uri> for CloseReason {
    type Error = anyhow::Error;
    fn try_from(value: &Uri) -> Result<Self, Self::Error> {
        match value.as_ref() {
            "wamp.close.normal" => Ok(Self::Normal),
            "wamp.close.system_shutdown" => Ok(Self::SystemShutdown),
            "wamp.close.close_realm" => Ok(Self::CloseRealm),
            "wamp.close.killed" => Ok(Self::Killed),
            "wamp.close.timed_out" => Ok(Self::TimedOut),
            "wamp.close.goodbye_and_out" => Ok(Self::GoodbyeAndOut),
            _ => Err(Self::Error::msg(format!("invalid close reason: {value}"))),
        }
    }
}

#[cfg(test)]
mod close_test {
    use crate::core::close::CloseReason;

    #[test]
    fn close_reasons_round_trip_through_uris() {
        for reason in [
            CloseReason::Normal,
            CloseReason::SystemShutdown,
            CloseReason::CloseRealm,
            CloseReason::Killed,
            CloseReason::TimedOut,
            CloseReason::GoodbyeAndOut,
        ] {
            assert_matches::assert_matches!(CloseReason::try_from(&reason.uri()), Ok(parsed) => {
                pretty_assertions::assert_eq!(parsed, reason);
            });
        }
    }
}
