use crate::error::{Error, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

lazy_static! {
    static ref SEMVER: Regex = Regex::new(
        r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-[0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*)?(?:\+[0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*)?$"
    )
    .unwrap();
}

/// Who the actor is and where its hub lives. Fixed for the lifetime of a
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorIdentity {
    /// Hub endpoint, e.g. `http://hub.local:3000`.
    pub address: String,
    /// Registration key; re-sent with every piped event.
    pub key: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Namespace the actor's capabilities are advertised under.
    pub module: String,
}

impl ActorIdentity {
    pub fn new(
        address: impl Into<String>,
        key: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        module: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            key: key.into(),
            name: name.into(),
            version: version.into(),
            description: None,
            module: module.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.address)
            .map_err(|err| Error::invalid_identity("address", err.to_string()))?;
        if !url.has_host() {
            return Err(Error::invalid_identity(
                "address",
                format!("{} has no host", self.address),
            ));
        }

        for (field, value) in [
            ("key", &self.key),
            ("name", &self.name),
            ("module", &self.module),
        ] {
            if value.trim().is_empty() {
                return Err(Error::invalid_identity(field, "must not be empty"));
            }
        }

        if !SEMVER.is_match(&self.version) {
            return Err(Error::invalid_identity(
                "version",
                format!("{:?} is not a semantic version", self.version),
            ));
        }

        Ok(())
    }
}
