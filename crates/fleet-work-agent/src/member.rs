//! Identity of the member cluster this agent runs in.

use std::collections::BTreeMap;

use snafu::Snafu;

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("cluster label {label:?} is not of the form key=value"))]
    MalformedLabel { label: String },
}

/// The member cluster as seen by the override engine: its name and label
/// set, fixed for the lifetime of the agent process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberCluster {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl MemberCluster {
    /// Builds the identity from CLI input, where labels arrive as
    /// `key=value` pairs.
    pub fn from_cli(name: String, labels: &[String]) -> Result<Self, Error> {
        let labels = labels
            .iter()
            .map(|label| {
                label
                    .split_once('=')
                    .map(|(key, value)| (key.to_owned(), value.to_owned()))
                    .ok_or(Error::MalformedLabel {
                        label: label.clone(),
                    })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { name, labels })
    }
}
