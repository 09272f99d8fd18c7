use anyhow::{bail, Context, Result};
use k8s_openapi::{api::core::v1::Pod, apimachinery::pkg::util::intstr::IntOrString};

/// Resolves `value` as a named container port on `pod`, falling back to parsing it as an integer.
///
/// Only the first item of a comma-separated list is considered.
pub fn port_value(pod: &Pod, value: &str) -> Result<i32> {
    let value = value.split(',').next().unwrap_or_default();
    let named = pod
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .find(|p| p.name.as_deref() == Some(value));
    if let Some(port) = named {
        return Ok(port.container_port);
    }
    parse_int(value).with_context(|| format!("parsing port {value:?}"))
}

/// Resolves a probe or service target port.
pub fn port_from_int_or_string(pod: &Pod, port: &IntOrString) -> Result<i32> {
    match port {
        IntOrString::Int(port) => Ok(*port),
        IntOrString::String(name) => port_value(pod, name),
    }
}

/// Resolves and validates the port named by `annotation`, falling back to `default`.
///
/// Ports taken from the annotation must lie in 1-65535 when `allow_privileged` is set and in
/// 1024-65535 otherwise. The default is resolved but not range-checked. `None` is returned when
/// neither is set.
pub fn determine_and_validate_port(
    pod: &Pod,
    annotation: &str,
    default: &str,
    allow_privileged: bool,
) -> Result<Option<i32>> {
    let raw = crate::annotations::pod_annotation(pod, annotation).filter(|v| !v.is_empty());
    if let Some(raw) = raw {
        let Ok(port) = port_value(pod, raw) else {
            bail!("{annotation} annotation value of {raw} is not a valid integer");
        };
        if allow_privileged && !(1..=65535).contains(&port) {
            bail!("{annotation} annotation value of {port} is not in the valid port range 1-65535");
        }
        if !allow_privileged && !(1024..=65535).contains(&port) {
            bail!(
                "{annotation} annotation value of {port} is not in the unprivileged port range 1024-65535"
            );
        }
        return Ok(Some(port));
    }

    if default.is_empty() {
        return Ok(None);
    }
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let port = port_value(pod, default)
        .map_err(|_| anyhow::anyhow!("{default} is not a valid port on the pod {name}"))?;
    Ok(Some(port))
}

/// Parses an integer with the base prefixes accepted by the injector (`0x`, `0o`, `0b`).
fn parse_int(value: &str) -> Result<i32> {
    let (neg, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    let (radix, digits) = if let Some(d) = digits.strip_prefix("0x").or(digits.strip_prefix("0X")) {
        (16, d)
    } else if let Some(d) = digits.strip_prefix("0o").or(digits.strip_prefix("0O")) {
        (8, d)
    } else if let Some(d) = digits.strip_prefix("0b").or(digits.strip_prefix("0B")) {
        (2, d)
    } else {
        (10, digits)
    };
    let magnitude = i64::from_str_radix(digits, radix)?;
    let value = if neg { -magnitude } else { magnitude };
    Ok(i32::try_from(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{
        api::core::v1::{Container, ContainerPort, PodSpec},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };
    use maplit::btreemap;

    fn pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                annotations: Some(btreemap! {
                    "low".to_string() => "80".to_string(),
                    "named".to_string() => "admin".to_string(),
                    "bogus".to_string() => "http-ish".to_string(),
                }),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    ports: Some(vec![
                        ContainerPort {
                            name: Some("http".to_string()),
                            container_port: 8080,
                            ..Default::default()
                        },
                        ContainerPort {
                            name: Some("admin".to_string()),
                            container_port: 9090,
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn port_values() {
        let pod = pod();
        assert_eq!(port_value(&pod, "http").unwrap(), 8080, "named");
        assert_eq!(port_value(&pod, "1234").unwrap(), 1234, "numeric");
        assert_eq!(port_value(&pod, "admin,http").unwrap(), 9090, "first of list");
        assert_eq!(port_value(&pod, "0x10").unwrap(), 16, "hex");
        assert!(port_value(&pod, "nope").is_err(), "unknown name");
        assert!(port_value(&pod, "").is_err(), "empty");
    }

    #[test]
    fn int_or_string() {
        let pod = pod();
        assert_eq!(port_from_int_or_string(&pod, &IntOrString::Int(7)).unwrap(), 7);
        assert_eq!(
            port_from_int_or_string(&pod, &IntOrString::String("http".to_string())).unwrap(),
            8080
        );
    }

    #[test]
    fn validate_ports() {
        let pod = pod();
        assert_eq!(
            determine_and_validate_port(&pod, "named", "", false).unwrap(),
            Some(9090)
        );
        assert_eq!(
            determine_and_validate_port(&pod, "low", "", true).unwrap(),
            Some(80)
        );
        let err = determine_and_validate_port(&pod, "low", "", false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "low annotation value of 80 is not in the unprivileged port range 1024-65535"
        );
        let err = determine_and_validate_port(&pod, "bogus", "", false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "bogus annotation value of http-ish is not a valid integer"
        );
        assert_eq!(
            determine_and_validate_port(&pod, "missing", "20200", false).unwrap(),
            Some(20200)
        );
        assert_eq!(
            determine_and_validate_port(&pod, "missing", "", false).unwrap(),
            None
        );
        assert!(determine_and_validate_port(&pod, "missing", "nope", false).is_err());
    }
}
