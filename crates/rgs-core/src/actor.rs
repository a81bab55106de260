use serde::{Deserialize, Serialize};

/// The class of principal that can initiate a request.
///
/// Actors are never owned by any record; every record that references one
/// stores only its `id` and `type`, resolved at query time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Player,
    Operator,
    Service,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Player => "player",
            ActorType::Operator => "operator",
            ActorType::Service => "service",
        }
    }
}

/// The authenticated principal of a request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(rename = "type")]
    pub actor_type: ActorType,
}

impl Actor {
    pub fn new(id: impl Into<String>, actor_type: ActorType) -> Self {
        Self {
            id: id.into(),
            actor_type,
        }
    }

    pub fn is_operator_or_service(&self) -> bool {
        matches!(self.actor_type, ActorType::Operator | ActorType::Service)
    }
}
