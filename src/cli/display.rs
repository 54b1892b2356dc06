//! Pure display logic (no I/O - returns formatted strings)

use crate::cluster::Role;

use super::HostStatus;

fn role_names(roles: &[Role]) -> String {
    roles
        .iter()
        .map(|r| match r {
            Role::Master => "master",
            Role::Node => "node",
            Role::Registry => "registry",
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Format the `status` table.
pub fn format_status(statuses: &[HostStatus]) -> String {
    let mut out = String::new();
    out.push_str(&format!("{:<24} {:<16} {}\n", "ADDRESS", "ROLES", "STATUS"));
    for s in statuses {
        out.push_str(&format!(
            "{:<24} {:<16} {}\n",
            s.address,
            role_names(&s.roles),
            if s.reachable { "Ready" } else { "Unreachable" }
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_status_lists_every_host() {
        let statuses = vec![
            HostStatus {
                address: "10.0.0.1".to_string(),
                roles: vec![Role::Master],
                reachable: true,
            },
            HostStatus {
                address: "10.0.0.3:2222".to_string(),
                roles: vec![Role::Node],
                reachable: false,
            },
        ];
        let out = format_status(&statuses);
        assert!(out.contains("10.0.0.1"));
        assert!(out.contains("master"));
        assert!(out.contains("Ready"));
        assert!(out.contains("10.0.0.3:2222"));
        assert!(out.contains("Unreachable"));
    }
}
