//! Signing configuration taken from the environment.
//!
//! | Variable                                | Meaning                      |
//! |-----------------------------------------|------------------------------|
//! | `DIGITAL_SIGNING_CERTIFICATE_PATH`      | PKCS #12 keystore            |
//! | `DIGITAL_SIGNING_CERTIFICATE_PASSWORD`  | keystore password            |
//! | `DIGITAL_SIGNING_PLACEHOLDER_SIZE`      | bytes reserved for the CMS   |
//! | `DIGITAL_SIGNING_FIELD_NAME`            | signature field name         |

use std::fmt;
use std::path::PathBuf;

use log::debug;

use crate::incremental_writer::DEFAULT_PLACEHOLDER_SIZE;
use crate::{Error, Result, DEFAULT_FIELD_NAME};

pub const CERTIFICATE_PATH_VAR: &str = "DIGITAL_SIGNING_CERTIFICATE_PATH";
pub const CERTIFICATE_PASSWORD_VAR: &str = "DIGITAL_SIGNING_CERTIFICATE_PASSWORD";
pub const PLACEHOLDER_SIZE_VAR: &str = "DIGITAL_SIGNING_PLACEHOLDER_SIZE";
pub const FIELD_NAME_VAR: &str = "DIGITAL_SIGNING_FIELD_NAME";

#[derive(Clone, PartialEq, Eq)]
pub struct SigningConfig {
    pub certificate_path: Option<PathBuf>,
    pub certificate_password: Option<String>,
    pub placeholder_size: usize,
    pub field_name: String,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            certificate_path: None,
            certificate_password: None,
            placeholder_size: DEFAULT_PLACEHOLDER_SIZE,
            field_name: DEFAULT_FIELD_NAME.to_string(),
        }
    }
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("certificate_path", &self.certificate_path)
            .field(
                "certificate_password",
                &self.certificate_password.as_ref().map(|_| "<redacted>"),
            )
            .field("placeholder_size", &self.placeholder_size)
            .field("field_name", &self.field_name)
            .finish()
    }
}

impl SigningConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source. Empty values count
    /// as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut config = Self {
            certificate_path: get(CERTIFICATE_PATH_VAR).map(PathBuf::from),
            certificate_password: get(CERTIFICATE_PASSWORD_VAR),
            ..Self::default()
        };
        if let Some(size) = get(PLACEHOLDER_SIZE_VAR) {
            config.placeholder_size = size.trim().parse().map_err(|_| {
                Error::Configuration(format!("{PLACEHOLDER_SIZE_VAR} is not a number: {size:?}"))
            })?;
        }
        if let Some(name) = get(FIELD_NAME_VAR) {
            config.field_name = name.trim().to_string();
        }

        debug!("signing configuration: {config:?}");
        Ok(config)
    }

    /// Checks that a keystore is configured and exists and that the other
    /// values are usable.
    pub fn validate(&self) -> Result<()> {
        let path = self
            .certificate_path
            .as_ref()
            .ok_or_else(|| Error::Configuration(format!("{CERTIFICATE_PATH_VAR} is not set")))?;
        if self.certificate_password.is_none() {
            return Err(Error::Configuration(format!(
                "{CERTIFICATE_PASSWORD_VAR} is not set"
            )));
        }
        if !path.is_file() {
            return Err(Error::CertificateNotFound(path.clone()));
        }
        if self.placeholder_size == 0 {
            return Err(Error::Configuration(
                "placeholder size must be positive".to_string(),
            ));
        }
        if self.field_name.contains('.') {
            return Err(Error::Configuration(format!(
                "field name {:?} must not contain a period",
                self.field_name
            )));
        }
        Ok(())
    }

    /// Keystore path and password, if both are configured.
    pub fn credentials(&self) -> Result<(&PathBuf, &str)> {
        match (&self.certificate_path, &self.certificate_password) {
            (Some(path), Some(password)) => Ok((path, password)),
            (None, _) => Err(Error::Configuration(format!("{CERTIFICATE_PATH_VAR} is not set"))),
            (_, None) => Err(Error::Configuration(format!(
                "{CERTIFICATE_PASSWORD_VAR} is not set"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = SigningConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SigningConfig::default());
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn reads_all_variables() {
        let config = SigningConfig::from_lookup(lookup(&[
            (CERTIFICATE_PATH_VAR, "certs/office.p12"),
            (CERTIFICATE_PASSWORD_VAR, "hunter2"),
            (PLACEHOLDER_SIZE_VAR, " 32768 "),
            (FIELD_NAME_VAR, "approval"),
        ]))
        .unwrap();

        assert_eq!(config.placeholder_size, 32768);
        assert_eq!(config.field_name, "approval");
        let (path, password) = config.credentials().unwrap();
        assert_eq!(path, &PathBuf::from("certs/office.p12"));
        assert_eq!(password, "hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn rejects_bad_placeholder_size() {
        let err =
            SigningConfig::from_lookup(lookup(&[(PLACEHOLDER_SIZE_VAR, "lots")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn validate_requires_existing_keystore() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.p12");
        let mut config = SigningConfig {
            certificate_path: Some(missing.clone()),
            certificate_password: Some("pw".to_string()),
            ..SigningConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::CertificateNotFound(p)) if p == missing));

        std::fs::write(&missing, b"keystore").unwrap();
        config.validate().unwrap();

        config.certificate_password = None;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }
}
