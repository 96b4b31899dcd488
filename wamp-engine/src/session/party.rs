use anyhow::Result;

use crate::core::{
    error::BasicError,
    features::{
        Feature,
        FeatureSet,
        features_from_dictionary,
        features_to_dictionary,
    },
    hash::HashMap,
    roles::Role,
    types::{
        Dictionary,
        Value,
    },
};

/// One side of a session, as described in HELLO or WELCOME details.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Party {
    /// Agent name.
    pub agent: String,
    /// Features advertised per concrete role.
    pub roles: HashMap<Role, FeatureSet>,
    /// Opaque identity token.
    pub identity: Option<String>,
}

impl Party {
    /// Checks if the party holds the role.
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains_key(&role)
    }

    /// Checks if the party advertised the feature under the role.
    pub fn supports(&self, role: Role, feature: Feature) -> bool {
        self.roles
            .get(&role)
            .is_some_and(|features| features.contains(&feature))
    }

    /// Reads a party out of HELLO or WELCOME details.
    ///
    /// Aggregate roles are expanded. Unknown roles are rejected, since the session could not
    /// serve them.
    pub fn from_details(details: &Dictionary) -> Result<Self> {
        let agent = details
            .get("agent")
            .and_then(|agent| agent.string())
            .unwrap_or_default()
            .to_owned();
        let identity = details
            .get("authid")
            .and_then(|identity| identity.string())
            .map(|identity| identity.to_owned());
        let role_details = match details.get("roles") {
            Some(Value::Dictionary(roles)) => roles,
            Some(_) => {
                return Err(BasicError::InvalidArgument("roles must be a dictionary".to_owned()).into());
            }
            None => {
                return Err(BasicError::InvalidArgument("missing roles".to_owned()).into());
            }
        };

        let mut roles = HashMap::<Role, FeatureSet>::default();
        for (name, role_details) in role_details {
            let role = Role::try_from(name.as_str())
                .map_err(|err| BasicError::InvalidArgument(err.to_string()))?;
            let features = role_details
                .dictionary()
                .and_then(|role_details| role_details.get("features"))
                .and_then(|features| features.dictionary());
            for role in role.expand() {
                let entry = roles.entry(*role).or_default();
                if let Some(features) = features {
                    entry.extend(features_from_dictionary(*role, features));
                }
            }
        }
        if roles.is_empty() {
            return Err(BasicError::InvalidArgument("at least one role is required".to_owned()).into());
        }

        Ok(Self {
            agent,
            roles,
            identity,
        })
    }

    /// Writes the party into HELLO or WELCOME details.
    pub fn to_details(&self) -> Dictionary {
        let mut details = Dictionary::default();
        details.insert("agent".to_owned(), Value::String(self.agent.clone()));
        details.insert(
            "roles".to_owned(),
            Value::Dictionary(
                self.roles
                    .iter()
                    .map(|(role, features)| {
                        let mut role_details = Dictionary::default();
                        if !features.is_empty() {
                            role_details.insert(
                                "features".to_owned(),
                                Value::Dictionary(features_to_dictionary(features)),
                            );
                        }
                        (role.to_string(), Value::Dictionary(role_details))
                    })
                    .collect(),
            ),
        );
        if let Some(identity) = &self.identity {
            details.insert("authid".to_owned(), Value::String(identity.clone()));
        }
        details
    }
}

#[cfg(test)]
mod party_test {
    use crate::{
        core::{
            features::{
                Feature,
                FeatureSet,
            },
            hash::HashMap,
            roles::Role,
            types::{
                Dictionary,
                Value,
            },
        },
        session::party::Party,
    };

    fn role_details(features: &[&str]) -> Value {
        Value::Dictionary(Dictionary::from_iter([(
            "features".to_owned(),
            Value::Dictionary(
                features
                    .iter()
                    .map(|feature| ((*feature).to_owned(), Value::Bool(true)))
                    .collect(),
            ),
        )]))
    }

    #[test]
    fn reads_roles_and_scoped_features() {
        let details = Dictionary::from_iter([
            ("agent".to_owned(), Value::from("test-agent")),
            ("authid".to_owned(), Value::from("alice")),
            (
                "roles".to_owned(),
                Value::Dictionary(Dictionary::from_iter([
                    (
                        "callee".to_owned(),
                        role_details(&["call_timeout", "publisher_exclusion"]),
                    ),
                    ("subscriber".to_owned(), Value::Dictionary(Dictionary::default())),
                ])),
            ),
        ]);
        assert_matches::assert_matches!(Party::from_details(&details), Ok(party) => {
            pretty_assertions::assert_eq!(party.agent, "test-agent");
            pretty_assertions::assert_eq!(party.identity.as_deref(), Some("alice"));
            assert!(party.has_role(Role::Callee));
            assert!(party.has_role(Role::Subscriber));
            assert!(!party.has_role(Role::Caller));
            assert!(party.supports(Role::Callee, Feature::CallTimeout));
            assert!(!party.supports(Role::Callee, Feature::PublisherExclusion));
        });
    }

    #[test]
    fn expands_aggregate_roles() {
        let details = Dictionary::from_iter([(
            "roles".to_owned(),
            Value::Dictionary(Dictionary::from_iter([(
                "router".to_owned(),
                Value::Dictionary(Dictionary::default()),
            )])),
        )]);
        assert_matches::assert_matches!(Party::from_details(&details), Ok(party) => {
            assert!(party.has_role(Role::Broker));
            assert!(party.has_role(Role::Dealer));
        });
    }

    #[test]
    fn rejects_missing_or_unknown_roles() {
        assert_matches::assert_matches!(Party::from_details(&Dictionary::default()), Err(_));
        let details = Dictionary::from_iter([(
            "roles".to_owned(),
            Value::Dictionary(Dictionary::from_iter([(
                "spectator".to_owned(),
                Value::Dictionary(Dictionary::default()),
            )])),
        )]);
        assert_matches::assert_matches!(Party::from_details(&details), Err(_));
    }

    #[test]
    fn survives_details_round_trip() {
        let party = Party {
            agent: "agent".to_owned(),
            roles: HashMap::from_iter([
                (
                    Role::Dealer,
                    FeatureSet::from_iter([Feature::CallReroute, Feature::CallCanceling]),
                ),
                (Role::Broker, FeatureSet::default()),
            ]),
            identity: None,
        };
        assert_matches::assert_matches!(Party::from_details(&party.to_details()), Ok(read) => {
            pretty_assertions::assert_eq!(read, party);
        });
    }
}
