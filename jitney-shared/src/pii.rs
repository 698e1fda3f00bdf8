use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Wrapper for sensitive contact data (passenger phone numbers) that masks
/// its value in Debug/Display output so it cannot leak through log macros.
///
/// Serialization passes the real value through: notification payloads need it
/// so the delivery channel can render a "call passenger" action, while
/// `tracing::info!("{:?}", event)` stays safe.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Masked<T>(T);

impl<T> Masked<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Deliberate access to the real value.
    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<T> for Masked<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}
