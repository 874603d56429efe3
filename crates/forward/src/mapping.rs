use std::collections::HashSet;

use crate::error::{ForwardError, Result};
use crate::tunnel::Target;

/// Namespace used by three-field descriptors when none is supplied.
pub const DEFAULT_NAMESPACE: &str = "default";

/// One configured forward: a local port bound to a backend target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortMapping {
    /// Local TCP port. `0` asks the OS for an ephemeral port.
    pub local_port: u16,
    pub namespace: String,
    pub target_name: String,
    pub target_port: u16,
}

impl PortMapping {
    pub fn new(
        local_port: u16,
        namespace: impl Into<String>,
        target_name: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            local_port,
            namespace: namespace.into(),
            target_name: target_name.into(),
            target_port,
        }
    }

    /// Parse a descriptor.
    ///
    /// Supported formats:
    /// ```text
    /// localPort:namespace:targetName:targetPort
    /// localPort:targetName:targetPort          (uses `default_namespace`)
    /// ```
    pub fn parse(descriptor: &str, default_namespace: &str) -> Result<Self> {
        let fields: Vec<&str> = descriptor.trim().split(':').map(str::trim).collect();

        let (local, namespace, name, remote) = match fields.as_slice() {
            [local, namespace, name, remote] => (*local, *namespace, *name, *remote),
            [local, name, remote] => (*local, default_namespace, *name, *remote),
            _ => {
                return Err(ForwardError::InvalidMapping(format!(
                    "'{descriptor}': expected localPort:namespace:name:port or \
                     localPort:name:port, got {} fields",
                    fields.len()
                )))
            }
        };

        let mapping = Self {
            local_port: parse_port(descriptor, "local port", local)?,
            namespace: namespace.to_string(),
            target_name: name.to_string(),
            target_port: parse_port(descriptor, "target port", remote)?,
        };
        mapping.validate()?;
        Ok(mapping)
    }

    /// Reject mappings with missing fields before a session is started.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(ForwardError::InvalidMapping(format!("{self}: namespace is empty")));
        }
        if self.target_name.is_empty() {
            return Err(ForwardError::InvalidMapping(format!("{self}: target name is empty")));
        }
        if self.target_port == 0 {
            return Err(ForwardError::InvalidMapping(format!("{self}: target port is 0")));
        }
        Ok(())
    }

    pub fn target(&self) -> Target {
        Target {
            namespace: self.namespace.clone(),
            name: self.target_name.clone(),
            port: self.target_port,
        }
    }
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.local_port, self.namespace, self.target_name, self.target_port
        )
    }
}

fn parse_port(descriptor: &str, what: &str, raw: &str) -> Result<u16> {
    match raw.parse::<u16>() {
        Ok(0) => Err(ForwardError::InvalidMapping(format!(
            "'{descriptor}': {what} must not be 0"
        ))),
        Ok(port) => Ok(port),
        Err(e) => Err(ForwardError::InvalidMapping(format!(
            "'{descriptor}': invalid {what} '{raw}': {e}"
        ))),
    }
}

/// Validate a whole mapping set: every entry individually, and no two
/// entries claiming the same (non-ephemeral) local port.
pub fn validate_all(mappings: &[PortMapping]) -> Result<()> {
    let mut seen = HashSet::new();
    for mapping in mappings {
        mapping.validate()?;
        if mapping.local_port != 0 && !seen.insert(mapping.local_port) {
            return Err(ForwardError::InvalidMapping(format!(
                "local port {} is used by more than one mapping",
                mapping.local_port
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_four_fields() {
        let mapping = PortMapping::parse("8080:dev:my-svc:80", DEFAULT_NAMESPACE).unwrap();
        assert_eq!(mapping, PortMapping::new(8080, "dev", "my-svc", 80));
    }

    #[test]
    fn test_parse_three_fields_uses_default_namespace() {
        let mapping = PortMapping::parse("9090:metrics:9091", "monitoring").unwrap();
        assert_eq!(mapping.namespace, "monitoring");
        assert_eq!(mapping.target_name, "metrics");
        assert_eq!(mapping.target_port, 9091);
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let mapping = PortMapping::parse(" 8080 : dev : web : 80 ", DEFAULT_NAMESPACE).unwrap();
        assert_eq!(mapping.to_string(), "8080:dev:web:80");
    }

    #[test]
    fn test_parse_rejects_wrong_field_count() {
        for bad in ["8080", "8080:80", "1:2:3:4:5", ""] {
            let err = PortMapping::parse(bad, DEFAULT_NAMESPACE).unwrap_err();
            assert!(matches!(err, ForwardError::InvalidMapping(_)), "{bad}: {err}");
        }
    }

    #[test]
    fn test_parse_rejects_bad_ports() {
        assert!(PortMapping::parse("http:dev:web:80", DEFAULT_NAMESPACE).is_err());
        assert!(PortMapping::parse("8080:dev:web:99999", DEFAULT_NAMESPACE).is_err());
        assert!(PortMapping::parse("0:dev:web:80", DEFAULT_NAMESPACE).is_err());
        assert!(PortMapping::parse("8080:dev:web:0", DEFAULT_NAMESPACE).is_err());
    }

    #[test]
    fn test_parse_rejects_empty_fields() {
        assert!(PortMapping::parse("8080::web:80", DEFAULT_NAMESPACE).is_err());
        assert!(PortMapping::parse("8080:dev::80", DEFAULT_NAMESPACE).is_err());
    }

    #[test]
    fn test_validate_all_rejects_duplicate_local_ports() {
        let mappings = vec![
            PortMapping::new(8080, "dev", "a", 80),
            PortMapping::new(8080, "dev", "b", 80),
        ];
        assert!(validate_all(&mappings).is_err());
    }

    #[test]
    fn test_validate_all_allows_several_ephemeral_ports() {
        let mappings = vec![
            PortMapping::new(0, "dev", "a", 80),
            PortMapping::new(0, "dev", "b", 80),
        ];
        assert!(validate_all(&mappings).is_ok());
    }

    #[test]
    fn test_target_carries_identity() {
        let target = PortMapping::new(8080, "dev", "my-svc", 80).target();
        assert_eq!(target.to_string(), "dev/my-svc:80");
    }
}
