//! Config generation - ordered override chains over immutable base documents
//!
//! Control-plane config documents are produced fresh per operation by
//! folding an ordered list of pure transform functions over a defaulted
//! base. Ordering is part of the contract: defaults, then user overrides,
//! then computed fields, then mode-specific overrides. The resulting
//! document is serialized once and never mutated after it leaves here.

use thiserror::Error;

/// Errors from config generation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to serialize config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One transform in an override chain.
pub type Override<T> = Box<dyn FnOnce(T) -> Result<T, ConfigError> + Send>;

/// Fold the overrides over the base strictly in the order supplied.
pub fn build<T>(base: T, overrides: Vec<Override<T>>) -> Result<T, ConfigError> {
    let mut doc = base;
    for apply in overrides {
        doc = apply(doc)?;
    }
    Ok(doc)
}

/// Deep-merge `overlay` onto `base`. Mappings merge key-wise; everything
/// else in the overlay replaces the base value.
pub fn merge_values(base: &mut serde_yaml::Value, overlay: &serde_yaml::Value) {
    use serde_yaml::Value;
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Apply user YAML overrides onto a serializable document.
pub fn apply_user_overrides<T>(doc: T, overrides: &serde_yaml::Value) -> Result<T, ConfigError>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let mut value = serde_yaml::to_value(&doc)?;
    merge_values(&mut value, overrides);
    Ok(serde_yaml::from_value(value)?)
}

/// Check that the virtual IP does not fall inside a CIDR block it must
/// route around (pod or service subnet).
pub fn ensure_vip_outside_cidr(vip: &str, cidr: &str, what: &str) -> Result<(), ConfigError> {
    if cidr_contains(cidr, vip)? {
        return Err(ConfigError::Invalid(format!(
            "ensure IP {} is not in {} range {}",
            vip, what, cidr
        )));
    }
    Ok(())
}

fn cidr_contains(cidr: &str, ip: &str) -> Result<bool, ConfigError> {
    let (net, bits) = cidr
        .split_once('/')
        .ok_or_else(|| ConfigError::Invalid(format!("invalid CIDR {}", cidr)))?;
    let bits: u32 = bits
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid CIDR {}", cidr)))?;
    let net: std::net::Ipv4Addr = net
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid CIDR {}", cidr)))?;
    let ip: std::net::Ipv4Addr = match ip.parse() {
        Ok(ip) => ip,
        // Non-IPv4 VIPs are out of range by definition here.
        Err(_) => return Ok(false),
    };
    if bits > 32 {
        return Err(ConfigError::Invalid(format!("invalid CIDR {}", cidr)));
    }
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    Ok(u32::from(net) & mask == u32::from(ip) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_in_order() {
        let overrides: Vec<Override<String>> = vec![
            Box::new(|s| Ok(s + "a")),
            Box::new(|s| Ok(s + "b")),
            Box::new(|s| Ok(s + "c")),
        ];
        assert_eq!(build(String::new(), overrides).unwrap(), "abc");
    }

    #[test]
    fn test_failing_override_stops_the_chain() {
        let overrides: Vec<Override<String>> = vec![
            Box::new(|s| Ok(s + "a")),
            Box::new(|_| Err(ConfigError::Invalid("bad".to_string()))),
            Box::new(|s| Ok(s + "c")),
        ];
        assert!(build(String::new(), overrides).is_err());
    }

    #[test]
    fn test_merge_values_is_keywise_for_mappings() {
        let mut base: serde_yaml::Value = serde_yaml::from_str(
            "networking:\n  dnsDomain: cluster.local\n  serviceSubnet: 10.96.0.0/22\n",
        )
        .unwrap();
        let overlay: serde_yaml::Value =
            serde_yaml::from_str("networking:\n  serviceSubnet: 10.100.0.0/16\n").unwrap();
        merge_values(&mut base, &overlay);
        let networking = base.get("networking").unwrap();
        assert_eq!(
            networking.get("serviceSubnet").unwrap().as_str().unwrap(),
            "10.100.0.0/16"
        );
        assert_eq!(
            networking.get("dnsDomain").unwrap().as_str().unwrap(),
            "cluster.local"
        );
    }

    #[test]
    fn test_vip_inside_service_cidr_is_rejected() {
        assert!(ensure_vip_outside_cidr("10.96.0.10", "10.96.0.0/22", "serviceSubnet").is_err());
        assert!(ensure_vip_outside_cidr("10.103.97.2", "10.96.0.0/22", "serviceSubnet").is_ok());
    }

    #[test]
    fn test_cidr_contains_edges() {
        assert!(cidr_contains("10.0.0.0/8", "10.255.255.255").unwrap());
        assert!(!cidr_contains("10.0.0.0/8", "11.0.0.0").unwrap());
        assert!(cidr_contains("0.0.0.0/0", "1.2.3.4").unwrap());
        assert!(cidr_contains("10.1.2.3/32", "10.1.2.3").unwrap());
        assert!(cidr_contains("10.0.0.0/8", "fd00::1").is_ok());
        assert!(cidr_contains("banana", "10.0.0.1").is_err());
    }
}
