use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{error::EngineError, schedule::Availability};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(OfferId);
id_type!(RequestId);
id_type!(UserId);

/// Inclusive range of class levels a tutor is willing to teach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRange {
    pub min: u8,
    pub max: u8,
}

/// Someone offering to teach `subject` during `availability`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Offer {
    pub id: OfferId,
    /// Carried along for callers; matching ignores it.
    pub owner: UserId,
    pub subject: String,
    pub availability: Availability,
    pub classes: ClassRange,
}

/// Someone asking to be taught `subject` during `availability`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    pub id: RequestId,
    pub owner: UserId,
    pub subject: String,
    pub availability: Availability,
}

impl Offer {
    pub fn new(
        id: i64,
        owner: UserId,
        subject: impl Into<String>,
        availability: Availability,
        classes: ClassRange,
    ) -> Self {
        Self {
            id: OfferId(id),
            owner,
            subject: subject.into(),
            availability,
            classes,
        }
    }
}

impl Request {
    pub fn new(
        id: i64,
        owner: UserId,
        subject: impl Into<String>,
        availability: Availability,
    ) -> Self {
        Self {
            id: RequestId(id),
            owner,
            subject: subject.into(),
            availability,
        }
    }
}

/// An offer as it arrives from storage or the wire, before required fields are checked.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawOffer {
    pub id: Option<i64>,
    pub owner: Option<i64>,
    pub subject: Option<String>,
    pub availability: Option<Availability>,
    pub min_class: Option<u8>,
    pub max_class: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRequest {
    pub id: Option<i64>,
    pub owner: Option<i64>,
    pub subject: Option<String>,
    pub availability: Option<Availability>,
}

fn required<T>(value: Option<T>, entity: &'static str, field: &'static str) -> Result<T, EngineError> {
    value.ok_or(EngineError::MissingField { entity, field })
}

impl TryFrom<RawOffer> for Offer {
    type Error = EngineError;

    fn try_from(raw: RawOffer) -> Result<Self, Self::Error> {
        Ok(Offer {
            id: OfferId(required(raw.id, "offer", "id")?),
            owner: UserId(required(raw.owner, "offer", "owner")?),
            subject: required(raw.subject, "offer", "subject")?,
            availability: required(raw.availability, "offer", "availability")?,
            classes: ClassRange {
                min: required(raw.min_class, "offer", "min_class")?,
                max: required(raw.max_class, "offer", "max_class")?,
            },
        })
    }
}

impl TryFrom<RawRequest> for Request {
    type Error = EngineError;

    fn try_from(raw: RawRequest) -> Result<Self, Self::Error> {
        Ok(Request {
            id: RequestId(required(raw.id, "request", "id")?),
            owner: UserId(required(raw.owner, "request", "owner")?),
            subject: required(raw.subject, "request", "subject")?,
            availability: required(raw.availability, "request", "availability")?,
        })
    }
}
