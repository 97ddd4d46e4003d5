use sysinfo::System;

/// Host facts sent to the remote registry (§4.7 step 8) and used to gate
/// agent registration on `fqdn` availability (§4.7 step 1).
pub fn collect(system: &System) -> Vec<(String, String)> {
    let mut facts = Vec::new();

    if let Some(fqdn) = System::host_name() {
        facts.push(("fqdn".to_string(), fqdn.clone()));
        facts.push(("hostname".to_string(), fqdn));
    }
    if let Some(os) = System::long_os_version() {
        facts.push(("os_pretty_name".to_string(), os));
    }
    if let Some(kernel) = System::kernel_version() {
        facts.push(("kernel_version".to_string(), kernel));
    }
    facts.push(("cpu_cores".to_string(), system.cpus().len().to_string()));
    facts.push(("memory_size_bytes".to_string(), system.total_memory().to_string()));

    facts
}

pub fn fqdn(facts: &[(String, String)]) -> Option<&str> {
    facts
        .iter()
        .find(|(k, _)| k == "fqdn")
        .map(|(_, v)| v.as_str())
}

/// Per-process snapshot published compressed as `top_info` (§4.8), grounded
/// on the original agent's `get_top_output`.
pub fn top_info_snapshot(system: &System) -> serde_json::Value {
    let processes: Vec<serde_json::Value> = system
        .processes()
        .values()
        .map(|p| {
            serde_json::json!({
                "pid": p.pid().as_u32(),
                "name": p.name().to_string(),
                "cpu_percent": p.cpu_usage(),
                "memory_bytes": p.memory(),
            })
        })
        .collect();

    serde_json::json!({
        "time": crate::cache::now_secs(),
        "processes": processes,
        "load": System::load_average().one,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fqdn_lookup_finds_the_fqdn_key() {
        let facts = vec![
            ("hostname".to_string(), "h".to_string()),
            ("fqdn".to_string(), "h.example.com".to_string()),
        ];
        assert_eq!(fqdn(&facts), Some("h.example.com"));
    }

    #[test]
    fn fqdn_lookup_returns_none_when_absent() {
        let facts = vec![("hostname".to_string(), "h".to_string())];
        assert_eq!(fqdn(&facts), None);
    }
}
