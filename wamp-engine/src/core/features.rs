use crate::core::{
    hash::HashSet,
    roles::Role,
    types::{
        Dictionary,
        Value,
    },
};

/// An optional protocol capability, advertised per role during session establishment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    /// Procedures may produce progressive results.
    ProgressiveCallResults,
    /// The callee enforces call timeouts.
    CallTimeout,
    /// A caller may actively cancel a procedure call.
    CallCanceling,
    /// The caller's session may be disclosed to the callee.
    CallerIdentification,
    /// Multiple callees may register the same procedure.
    SharedRegistration,
    /// A callee may refuse an invocation so that the dealer tries another callee.
    CallReroute,
    /// The publisher may be excluded from receiving its own events.
    PublisherExclusion,
    /// Publications may be restricted to or withheld from sessions.
    SubscriberBlackwhiteListing,
    /// The publisher's session may be disclosed to subscribers.
    PublisherIdentification,
}

impl Feature {
    /// Every known feature.
    pub const ALL: &'static [Feature] = &[
        Self::ProgressiveCallResults,
        Self::CallTimeout,
        Self::CallCanceling,
        Self::CallerIdentification,
        Self::SharedRegistration,
        Self::CallReroute,
        Self::PublisherExclusion,
        Self::SubscriberBlackwhiteListing,
        Self::PublisherIdentification,
    ];

    /// The roles that may advertise the feature.
    pub fn roles(&self) -> &'static [Role] {
        match self {
            Self::ProgressiveCallResults
            | Self::CallTimeout
            | Self::CallCanceling
            | Self::CallerIdentification => &[Role::Caller, Role::Callee, Role::Dealer],
            Self::SharedRegistration | Self::CallReroute => &[Role::Callee, Role::Dealer],
            Self::PublisherExclusion | Self::SubscriberBlackwhiteListing => {
                &[Role::Publisher, Role::Broker]
            }
            Self::PublisherIdentification => &[Role::Publisher, Role::Subscriber, Role::Broker],
        }
    }

    /// Checks if the feature can be advertised under the given role.
    pub fn is_scoped_to(&self, role: Role) -> bool {
        self.roles().contains(&role)
    }
}

impl TryFrom<&str> for Feature {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "progressive_call_results" => Ok(Self::ProgressiveCallResults),
            "call_timeout" => Ok(Self::CallTimeout),
            "call_canceling" => Ok(Self::CallCanceling),
            "caller_identification" => Ok(Self::CallerIdentification),
            "shared_registration" => Ok(Self::SharedRegistration),
            "call_reroute" => Ok(Self::CallReroute),
            "publisher_exclusion" => Ok(Self::PublisherExclusion),
            "subscriber_blackwhite_listing" => Ok(Self::SubscriberBlackwhiteListing),
            "publisher_identification" => Ok(Self::PublisherIdentification),
            _ => Err(Self::Error::msg(format!("unknown feature: {value}"))),
        }
    }
}

impl From<Feature> for &'static str {
    fn from(value: Feature) -> Self {
        match value {
            Feature::ProgressiveCallResults => "progressive_call_results",
            Feature::CallTimeout => "call_timeout",
            Feature::CallCanceling => "call_canceling",
            Feature::CallerIdentification => "caller_identification",
            Feature::SharedRegistration => "shared_registration",
            Feature::CallReroute => "call_reroute",
            Feature::PublisherExclusion => "publisher_exclusion",
            Feature::SubscriberBlackwhiteListing => "subscriber_blackwhite_listing",
            Feature::PublisherIdentification => "publisher_identification",
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).into())
    }
}

/// A set of features advertised under one role.
pub type FeatureSet = HashSet<Feature>;

/// The features a role advertises: what the implementation supports, narrowed by what was
/// requested (everything when nothing was requested), and scoped to the role.
pub fn negotiate_features(
    role: Role,
    supported: &FeatureSet,
    requested: Option<&FeatureSet>,
) -> FeatureSet {
    supported
        .iter()
        .filter(|feature| feature.is_scoped_to(role))
        .filter(|feature| requested.is_none_or(|requested| requested.contains(feature)))
        .cloned()
        .collect()
}

/// Serializes a feature set into the `features` dictionary of a role.
pub fn features_to_dictionary(features: &FeatureSet) -> Dictionary {
    features
        .iter()
        .map(|feature| (feature.to_string(), Value::Bool(true)))
        .collect()
}

/// Reads the features enabled in a `features` dictionary advertised under a role.
///
/// Unknown features, disabled features, and features out of scope for the role are dropped.
pub fn features_from_dictionary(role: Role, features: &Dictionary) -> FeatureSet {
    features
        .iter()
        .filter(|(_, value)| value.bool().unwrap_or(false))
        .filter_map(|(name, _)| Feature::try_from(name.as_str()).ok())
        .filter(|feature| feature.is_scoped_to(role))
        .collect()
}

#[cfg(test)]
mod features_test {
    use crate::core::{
        features::{
            Feature,
            FeatureSet,
            features_from_dictionary,
            features_to_dictionary,
            negotiate_features,
        },
        roles::Role,
        types::{
            Dictionary,
            Value,
        },
    };

    #[test]
    fn negotiates_intersection_scoped_to_role() {
        let supported = FeatureSet::from_iter([
            Feature::CallTimeout,
            Feature::CallReroute,
            Feature::PublisherExclusion,
        ]);
        pretty_assertions::assert_eq!(
            negotiate_features(Role::Callee, &supported, None),
            FeatureSet::from_iter([Feature::CallTimeout, Feature::CallReroute])
        );
        pretty_assertions::assert_eq!(
            negotiate_features(
                Role::Callee,
                &supported,
                Some(&FeatureSet::from_iter([Feature::CallTimeout]))
            ),
            FeatureSet::from_iter([Feature::CallTimeout])
        );
        pretty_assertions::assert_eq!(
            negotiate_features(Role::Caller, &supported, None),
            FeatureSet::from_iter([Feature::CallTimeout])
        );
    }

    #[test]
    fn reads_only_known_enabled_features() {
        let features = Dictionary::from_iter([
            ("call_timeout".to_owned(), Value::Bool(true)),
            ("call_canceling".to_owned(), Value::Bool(false)),
            ("shared_registration".to_owned(), Value::Bool(true)),
            ("publisher_exclusion".to_owned(), Value::Bool(true)),
            ("x_custom".to_owned(), Value::Bool(true)),
        ]);
        pretty_assertions::assert_eq!(
            features_from_dictionary(Role::Caller, &features),
            FeatureSet::from_iter([Feature::CallTimeout])
        );
        pretty_assertions::assert_eq!(
            features_from_dictionary(Role::Dealer, &features),
            FeatureSet::from_iter([Feature::CallTimeout, Feature::SharedRegistration])
        );
    }

    #[test]
    fn serializes_features_as_flags() {
        pretty_assertions::assert_eq!(
            features_to_dictionary(&FeatureSet::from_iter([Feature::ProgressiveCallResults])),
            Dictionary::from_iter([(
                "progressive_call_results".to_owned(),
                Value::Bool(true)
            )])
        );
    }
}
