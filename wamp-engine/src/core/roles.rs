use crate::core::hash::HashSet;

/// A role a session can take on.
///
/// [`Role::Router`] and [`Role::Client`] are aggregates that expand to their concrete roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// Routes pub/sub and RPC traffic (broker + dealer).
    Router,
    /// Routes pub/sub traffic.
    Broker,
    /// Routes RPC traffic.
    Dealer,
    /// Publishes events to topics.
    Publisher,
    /// Subscribes to events for topics.
    Subscriber,
    /// Calls RPC endpoints.
    Caller,
    /// Registers RPC endpoints.
    Callee,
    /// Uses the router (publisher + subscriber + caller + callee).
    Client,
}

impl Role {
    /// The concrete roles this role stands for.
    pub fn expand(&self) -> &'static [Role] {
        match self {
            Self::Router => &[Self::Broker, Self::Dealer],
            Self::Client => &[Self::Publisher, Self::Subscriber, Self::Caller, Self::Callee],
            Self::Broker => &[Self::Broker],
            Self::Dealer => &[Self::Dealer],
            Self::Publisher => &[Self::Publisher],
            Self::Subscriber => &[Self::Subscriber],
            Self::Caller => &[Self::Caller],
            Self::Callee => &[Self::Callee],
        }
    }

    /// Checks if the role is a router-side role.
    pub fn is_router_role(&self) -> bool {
        matches!(self, Self::Router | Self::Broker | Self::Dealer)
    }

    /// The router role that serves a peer in this role.
    ///
    /// Router roles serve no one.
    pub fn serving_router_role(&self) -> Option<Role> {
        match self {
            Self::Publisher | Self::Subscriber => Some(Self::Broker),
            Self::Caller | Self::Callee => Some(Self::Dealer),
            _ => None,
        }
    }
}

/// Expands aggregate roles into the set of concrete roles.
pub fn expand_roles<'a, I>(roles: I) -> HashSet<Role>
where
    I: IntoIterator<Item = &'a Role>,
{
    roles
        .into_iter()
        .flat_map(|role| role.expand().iter().cloned())
        .collect()
}

impl TryFrom<&str> for Role {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "router" => Ok(Self::Router),
            "broker" => Ok(Self::Broker),
            "dealer" => Ok(Self::Dealer),
            "publisher" => Ok(Self::Publisher),
            "subscriber" => Ok(Self::Subscriber),
            "caller" => Ok(Self::Caller),
            "callee" => Ok(Self::Callee),
            "client" => Ok(Self::Client),
            _ => Err(Self::Error::msg(format!("invalid role: {value}"))),
        }
    }
}

impl From<Role> for &'static str {
    fn from(value: Role) -> Self {
        match value {
            Role::Router => "router",
            Role::Broker => "broker",
            Role::Dealer => "dealer",
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
            Role::Caller => "caller",
            Role::Callee => "callee",
            Role::Client => "client",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).into())
    }
}
