//! Datastore path parsing (`[store-name] folder/file.iso`).

use std::fmt;
use std::str::FromStr;

use super::ParamsError;

/// A file location on a hypervisor datastore.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatastorePath {
    datastore: String,
    path: String,
}

impl DatastorePath {
    /// Name of the datastore (the bracketed part).
    #[must_use]
    pub fn datastore(&self) -> &str {
        &self.datastore
    }

    /// Path of the file inside the datastore.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// File name component of [`Self::path`].
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl FromStr for DatastorePath {
    type Err = ParamsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ParamsError::DatastorePath(value.to_owned());
        let rest = value.trim().strip_prefix('[').ok_or_else(invalid)?;
        let (store, path) = rest.split_once(']').ok_or_else(invalid)?;
        let datastore = store.trim();
        let file_path = path.trim().trim_start_matches('/');
        if datastore.is_empty() || file_path.is_empty() || file_path.ends_with('/') {
            return Err(invalid());
        }
        Ok(Self {
            datastore: datastore.to_owned(),
            path: file_path.to_owned(),
        })
    }
}

impl fmt::Display for DatastorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.datastore, self.path)
    }
}
