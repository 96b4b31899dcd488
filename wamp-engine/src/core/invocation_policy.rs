/// How a callee should be selected for invocations of a shared registration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum InvocationPolicy {
    /// The procedure has exactly one callee.
    #[default]
    Single,
    /// Invocations rotate through callees in order of registration.
    RoundRobin,
    /// Invocations go to a random callee.
    Random,
    /// Invocations go to the earliest registered callee.
    First,
    /// Invocations go to the latest registered callee.
    Last,
}

impl InvocationPolicy {
    /// Checks if the policy allows more than one callee.
    pub fn is_shared(&self) -> bool {
        !matches!(self, Self::Single)
    }
}

impl TryFrom<&str> for InvocationPolicy {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "single" => Ok(Self::Single),
            "roundrobin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            _ => Err(Self::Error::msg(format!(
                "invalid invocation policy: {value}"
            ))),
        }
    }
}

impl From<InvocationPolicy> for &'static str {
    fn from(value: InvocationPolicy) -> Self {
        match value {
            InvocationPolicy::Single => "single",
            InvocationPolicy::RoundRobin => "roundrobin",
            InvocationPolicy::Random => "random",
            InvocationPolicy::First => "first",
            InvocationPolicy::Last => "last",
        }
    }
}
