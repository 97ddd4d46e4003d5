use crate::cache::SampleCache;
use crate::model::MetricSample;
use regex::Regex;
use std::sync::{Mutex, OnceLock};

/// One unresolved derived-metric computation, queued until its dependencies
/// are observed in the Sample Cache (§4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
enum Derived {
    DiskTotal { item: String },
    CpuOther,
    MemTotal,
    SwapTotal,
    ProcessTotal,
}

#[derive(Debug, Clone)]
struct PendingToken {
    derived: Derived,
    time_bits: u64,
}

fn naming_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<plugin>[^-.]+)(-(?P<plugin_instance>[^.]+))?\.(?P<type>[^.-]+)([.-](?P<type_instance>.+))?$")
            .expect("naming regex is a constant")
    })
}

/// Converts raw collector lines (`name value timestamp`) into canonical
/// samples, queuing cross-metric derivations until their dependencies have
/// arrived (C4).
pub struct DerivationEngine {
    path_ignore: Vec<String>,
    host_mount_point: Option<String>,
    disk_monitor: Vec<Regex>,
    network_blacklist: Vec<String>,
    pending: Mutex<Vec<PendingToken>>,
    last_tick: Mutex<Option<f64>>,
}

impl DerivationEngine {
    pub fn new(
        path_ignore: Vec<String>,
        host_mount_point: Option<String>,
        disk_monitor_patterns: &[String],
        network_blacklist: Vec<String>,
    ) -> Self {
        let disk_monitor = disk_monitor_patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();

        DerivationEngine {
            path_ignore,
            host_mount_point,
            disk_monitor,
            network_blacklist,
            pending: Mutex::new(Vec::new()),
            last_tick: Mutex::new(None),
        }
    }

    /// Parse one line of the collector wire format, emit canonical samples
    /// into `out`, and queue any derived computations that become due. A
    /// malformed or unrecognized line is silently dropped (Property 1).
    pub fn feed_line(&self, line: &str, cache: &SampleCache, out: &mut Vec<MetricSample>) {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(value_str), Some(time_str)) = (parts.next(), parts.next(), parts.next())
        else {
            return;
        };
        let Ok(value) = value_str.parse::<f64>() else {
            return;
        };
        let Ok(time) = time_str.parse::<f64>() else {
            return;
        };

        let without_host = match name.split_once('.') {
            Some((_, rest)) => rest,
            None => return,
        };

        let Some(caps) = naming_regex().captures(without_host) else {
            return;
        };
        let plugin = &caps["plugin"];
        let plugin_instance = caps.name("plugin_instance").map(|m| m.as_str());
        let typ = &caps["type"];
        let type_instance = caps.name("type_instance").map(|m| m.as_str());

        self.rename(plugin, plugin_instance, typ, type_instance, value, time, out);
        self.maybe_tick(time, cache, out);
    }

    fn rename(
        &self,
        plugin: &str,
        plugin_instance: Option<&str>,
        typ: &str,
        type_instance: Option<&str>,
        value: f64,
        time: f64,
        out: &mut Vec<MetricSample>,
    ) {
        match plugin {
            "cpu" => self.rename_cpu(type_instance, value, time, out),
            "df" => self.rename_df(plugin_instance, type_instance, value, time, out),
            "disk" => self.rename_disk(plugin_instance, typ, type_instance, value, time, out),
            "interface" => self.rename_interface(plugin_instance, typ, type_instance, value, time, out),
            "load" => self.rename_load(typ, value, time, out),
            "memory" => self.rename_memory(type_instance, value, time, out),
            "processes" => self.rename_processes(plugin_instance, typ, type_instance, value, time, out),
            "swap" => self.rename_swap(typ, type_instance, value, time, out),
            "users" => {
                if typ == "users" {
                    out.push(MetricSample::new("users_logged", time, value));
                }
            }
            "ntpd" => {
                if typ == "time_offset" && type_instance == Some("loop") {
                    let mut s = MetricSample::new("ntp_time_offset", time, value / 1000.0);
                    s.service = Some("ntp".to_string());
                    out.push(s);
                }
            }
            "apache" | "mysql" | "postgresql" | "redis" => {
                self.rename_service_plugin(plugin, plugin_instance, typ, type_instance, value, time, out)
            }
            _ => {}
        }
    }

    fn rename_cpu(&self, type_instance: Option<&str>, value: f64, time: f64, out: &mut Vec<MetricSample>) {
        let Some(instance) = type_instance else { return };
        let lower = instance.to_lowercase();
        out.push(MetricSample::new(format!("cpu_{lower}"), time, value));
        if lower == "idle" {
            out.push(MetricSample::new("cpu_used", time, 100.0 - value));
            self.queue(Derived::CpuOther, time);
        }
    }

    fn rename_df(
        &self,
        plugin_instance: Option<&str>,
        type_instance: Option<&str>,
        value: f64,
        time: f64,
        out: &mut Vec<MetricSample>,
    ) {
        let Some(path) = self.canonical_disk_path(plugin_instance) else {
            return;
        };
        let Some(kind) = type_instance else { return };

        let measurement = match kind {
            "used" => "disk_used",
            "free" => "disk_free",
            "reserved" => "disk_reserved",
            _ => return,
        };

        out.push(MetricSample::new(measurement, time, value).with_item(path.clone()));
        self.queue(Derived::DiskTotal { item: path }, time);
    }

    fn canonical_disk_path(&self, plugin_instance: Option<&str>) -> Option<String> {
        let raw = plugin_instance?;
        let path = if raw == "root" {
            "/".to_string()
        } else {
            format!("/{}", raw.replace('-', "/"))
        };

        if self.path_ignore.iter().any(|ignored| path.starts_with(ignored.as_str())) {
            return None;
        }

        if let Some(mount) = &self.host_mount_point {
            if !path.starts_with(mount.as_str()) {
                return None;
            }
            let stripped = path.strip_prefix(mount.as_str()).unwrap_or(&path);
            return Some(if stripped.is_empty() { "/".to_string() } else { stripped.to_string() });
        }

        Some(path)
    }

    fn device_allowed(&self, device: &str) -> bool {
        if self.disk_monitor.is_empty() {
            return true;
        }
        self.disk_monitor.iter().any(|re| re.is_match(device))
    }

    fn rename_disk(
        &self,
        device: Option<&str>,
        typ: &str,
        type_instance: Option<&str>,
        value: f64,
        time: f64,
        out: &mut Vec<MetricSample>,
    ) {
        let Some(device) = device else { return };
        if !self.device_allowed(device) {
            return;
        }

        match (typ, type_instance) {
            ("disk_octets", Some("read")) => {
                out.push(MetricSample::new("io_read_bytes", time, value).with_item(device.to_string()));
            }
            ("disk_octets", Some("write")) => {
                out.push(MetricSample::new("io_write_bytes", time, value).with_item(device.to_string()));
            }
            ("disk_merged", Some(dir @ ("read" | "write"))) => {
                out.push(
                    MetricSample::new(format!("io_{dir}_merged"), time, value).with_item(device.to_string()),
                );
            }
            ("disk_ops", Some(dir @ ("read" | "write"))) => {
                out.push(MetricSample::new(format!("io_{dir}s"), time, value).with_item(device.to_string()));
            }
            ("disk_time", Some(dir @ ("read" | "write"))) => {
                out.push(
                    MetricSample::new(format!("io_{dir}_time"), time, value).with_item(device.to_string()),
                );
            }
            ("pending_operations", None) => {
                out.push(MetricSample::new("io_pending_operations", time, value).with_item(device.to_string()));
            }
            ("weighted_io_time", None) => {
                out.push(MetricSample::new("io_time_weighted", time, value).with_item(device.to_string()));
            }
            ("io_time", None) => {
                out.push(MetricSample::new("io_time", time, value).with_item(device.to_string()));
                out.push(
                    MetricSample::new("io_utilization", time, value / 10.0).with_item(device.to_string()),
                );
            }
            _ => {}
        }
    }

    fn rename_interface(
        &self,
        iface: Option<&str>,
        typ: &str,
        type_instance: Option<&str>,
        value: f64,
        time: f64,
        out: &mut Vec<MetricSample>,
    ) {
        let Some(iface) = iface else { return };
        if self.network_blacklist.iter().any(|b| b == iface) {
            return;
        }

        match (typ, type_instance) {
            ("if_octets", Some("rx")) => {
                out.push(MetricSample::new("net_bits_recv", time, value * 8.0).with_item(iface.to_string()));
            }
            ("if_octets", Some("tx")) => {
                out.push(MetricSample::new("net_bits_sent", time, value * 8.0).with_item(iface.to_string()));
            }
            ("if_errors", Some("rx")) => {
                out.push(MetricSample::new("net_err_in", time, value).with_item(iface.to_string()));
            }
            ("if_errors", Some("tx")) => {
                out.push(MetricSample::new("net_err_out", time, value).with_item(iface.to_string()));
            }
            ("if_packets", Some("rx")) => {
                out.push(MetricSample::new("net_packets_recv", time, value).with_item(iface.to_string()));
            }
            ("if_packets", Some("tx")) => {
                out.push(MetricSample::new("net_packets_sent", time, value).with_item(iface.to_string()));
            }
            _ => {}
        }
    }

    fn rename_load(&self, typ: &str, value: f64, time: f64, out: &mut Vec<MetricSample>) {
        let measurement = match typ {
            "shortterm" => "system_load1",
            "midterm" => "system_load5",
            "longterm" => "system_load15",
            _ => return,
        };
        out.push(MetricSample::new(measurement, time, value));
    }

    fn rename_memory(&self, type_instance: Option<&str>, value: f64, time: f64, out: &mut Vec<MetricSample>) {
        let Some(kind) = type_instance else { return };
        match kind {
            "used" | "buffered" | "cached" | "free" => {
                out.push(MetricSample::new(format!("mem_{kind}"), time, value));
                self.queue(Derived::MemTotal, time);
            }
            _ => {}
        }
    }

    fn rename_processes(
        &self,
        plugin_instance: Option<&str>,
        typ: &str,
        type_instance: Option<&str>,
        value: f64,
        time: f64,
        out: &mut Vec<MetricSample>,
    ) {
        let _ = plugin_instance;
        match (typ, type_instance) {
            ("ps_state", Some(state)) => {
                out.push(MetricSample::new(format!("process_status_{state}"), time, value));
                self.queue(Derived::ProcessTotal, time);
            }
            ("fork_rate", None) => {
                out.push(MetricSample::new("process_fork_rate", time, value));
            }
            _ => {}
        }
    }

    fn rename_swap(&self, typ: &str, type_instance: Option<&str>, value: f64, time: f64, out: &mut Vec<MetricSample>) {
        match typ {
            "swap" => {
                if let Some(state) = type_instance {
                    out.push(MetricSample::new(format!("swap_{state}"), time, value));
                    self.queue(Derived::SwapTotal, time);
                }
            }
            "swap_io" => {
                if let Some(direction) = type_instance {
                    out.push(MetricSample::new(format!("swap_{direction}"), time, value));
                }
            }
            _ => {}
        }
    }

    fn rename_service_plugin(
        &self,
        plugin: &str,
        plugin_instance: Option<&str>,
        typ: &str,
        type_instance: Option<&str>,
        value: f64,
        time: f64,
        out: &mut Vec<MetricSample>,
    ) {
        let Some(instance) = plugin_instance else { return };
        let Some(suffix) = instance.strip_prefix("bleemeo-") else {
            return;
        };

        let measurement = match type_instance {
            Some(ti) => format!("{plugin}_{typ}_{ti}"),
            None => format!("{plugin}_{typ}"),
        };
        let mut sample = MetricSample::new(measurement, time, value).with_item(suffix.to_string());
        sample.service = Some(plugin.to_string());
        out.push(sample);
    }

    fn queue(&self, derived: Derived, time: f64) {
        let mut guard = self.pending.lock().unwrap();
        if !guard.iter().any(|t| t.derived == derived) {
            guard.push(PendingToken {
                derived,
                time_bits: time.to_bits(),
            });
        }
    }

    /// Tick detection: a timestamp advancing by more than a second since the
    /// last-seen tick triggers a pass over the pending queue, same as
    /// end-of-batch.
    fn maybe_tick(&self, time: f64, cache: &SampleCache, out: &mut Vec<MetricSample>) {
        let mut last = self.last_tick.lock().unwrap();
        let should_run = match *last {
            Some(prev) => time - prev > 1.0,
            None => true,
        };
        *last = Some(time);
        drop(last);

        if should_run {
            self.drain_pending(cache, out);
        }
    }

    /// Called at end-of-batch (e.g. connection read loop drains) in addition
    /// to tick-triggered draining.
    pub fn drain_pending(&self, cache: &SampleCache, out: &mut Vec<MetricSample>) {
        let tokens = std::mem::take(&mut *self.pending.lock().unwrap());
        let mut still_pending = Vec::new();

        for token in tokens {
            let time = f64::from_bits(token.time_bits);
            match self.try_compute(&token.derived, time, cache, out) {
                ComputeResult::Done => {}
                ComputeResult::Pending => still_pending.push(token),
                ComputeResult::Unreachable => {}
            }
        }

        self.pending.lock().unwrap().extend(still_pending);
    }

    fn try_compute(
        &self,
        derived: &Derived,
        time: f64,
        cache: &SampleCache,
        out: &mut Vec<MetricSample>,
    ) -> ComputeResult {
        match derived {
            Derived::DiskTotal { item } => self.compute_disk_total(item, time, cache, out),
            Derived::CpuOther => self.compute_cpu_other(time, cache, out),
            Derived::MemTotal => self.compute_mem_total(time, cache, out),
            Derived::SwapTotal => self.compute_swap_total(time, cache, out),
            Derived::ProcessTotal => self.compute_process_total(time, cache, out),
        }
    }

    fn dependency(&self, cache: &SampleCache, measurement: &str, item: Option<&str>, time: f64) -> Dependency {
        match cache.get(measurement, item) {
            None => Dependency::Pending,
            Some(sample) if sample.time < time => Dependency::Pending,
            Some(sample) if sample.time > time => Dependency::Unreachable,
            Some(sample) => Dependency::Ready(sample.value),
        }
    }

    fn compute_disk_total(
        &self,
        item: &str,
        time: f64,
        cache: &SampleCache,
        out: &mut Vec<MetricSample>,
    ) -> ComputeResult {
        let used = match self.dependency(cache, "disk_used", Some(item), time) {
            Dependency::Ready(v) => v,
            Dependency::Pending => return ComputeResult::Pending,
            Dependency::Unreachable => return ComputeResult::Unreachable,
        };
        let free = match self.dependency(cache, "disk_free", Some(item), time) {
            Dependency::Ready(v) => v,
            Dependency::Pending => return ComputeResult::Pending,
            Dependency::Unreachable => return ComputeResult::Unreachable,
        };
        let reserved = match self.dependency(cache, "disk_reserved", Some(item), time) {
            Dependency::Ready(v) => v,
            Dependency::Pending => 0.0,
            Dependency::Unreachable => 0.0,
        };

        let total = used + free + reserved;
        out.push(MetricSample::new("disk_total", time, total).with_item(item.to_string()));
        let used_perc = if used + free > 0.0 {
            (100.0 * used / (used + free)).min(100.0)
        } else {
            0.0
        };
        out.push(MetricSample::new("disk_used_perc", time, used_perc).with_item(item.to_string()));
        ComputeResult::Done
    }

    fn compute_cpu_other(&self, time: f64, cache: &SampleCache, out: &mut Vec<MetricSample>) -> ComputeResult {
        let used = match self.dependency(cache, "cpu_used", None, time) {
            Dependency::Ready(v) => v,
            Dependency::Pending => return ComputeResult::Pending,
            Dependency::Unreachable => return ComputeResult::Unreachable,
        };
        let user = match self.dependency(cache, "cpu_user", None, time) {
            Dependency::Ready(v) => v,
            Dependency::Pending => return ComputeResult::Pending,
            Dependency::Unreachable => return ComputeResult::Unreachable,
        };
        let system = match self.dependency(cache, "cpu_system", None, time) {
            Dependency::Ready(v) => v,
            Dependency::Pending => return ComputeResult::Pending,
            Dependency::Unreachable => return ComputeResult::Unreachable,
        };

        // may legitimately go negative due to accounting skew; emitted as-is
        out.push(MetricSample::new("cpu_other", time, used - user - system));
        ComputeResult::Done
    }

    fn compute_mem_total(&self, time: f64, cache: &SampleCache, out: &mut Vec<MetricSample>) -> ComputeResult {
        let mut total = 0.0;
        for measurement in ["mem_used", "mem_buffered", "mem_cached", "mem_free"] {
            match self.dependency(cache, measurement, None, time) {
                Dependency::Ready(v) => total += v,
                Dependency::Pending => return ComputeResult::Pending,
                Dependency::Unreachable => return ComputeResult::Unreachable,
            }
        }
        out.push(MetricSample::new("mem_total", time, total));
        let used = match self.dependency(cache, "mem_used", None, time) {
            Dependency::Ready(v) => v,
            _ => return ComputeResult::Done,
        };
        let used_perc = if total > 0.0 { 100.0 * used / total } else { 0.0 };
        out.push(MetricSample::new("mem_used_perc", time, used_perc));
        ComputeResult::Done
    }

    fn compute_swap_total(&self, time: f64, cache: &SampleCache, out: &mut Vec<MetricSample>) -> ComputeResult {
        let used = match self.dependency(cache, "swap_used", None, time) {
            Dependency::Ready(v) => v,
            Dependency::Pending => return ComputeResult::Pending,
            Dependency::Unreachable => return ComputeResult::Unreachable,
        };
        let free = match self.dependency(cache, "swap_free", None, time) {
            Dependency::Ready(v) => v,
            Dependency::Pending => return ComputeResult::Pending,
            Dependency::Unreachable => return ComputeResult::Unreachable,
        };

        let total = used + free;
        out.push(MetricSample::new("swap_total", time, total));
        let used_perc = if total > 0.0 { 100.0 * used / total } else { 0.0 };
        out.push(MetricSample::new("swap_used_perc", time, used_perc));
        ComputeResult::Done
    }

    fn compute_process_total(&self, time: f64, cache: &SampleCache, out: &mut Vec<MetricSample>) -> ComputeResult {
        let states = ["blocked", "paging", "running", "sleeping", "stopped", "zombies"];
        let mut total = 0.0;
        for state in states {
            let measurement = format!("process_status_{state}");
            match self.dependency(cache, &measurement, None, time) {
                Dependency::Ready(v) => total += v,
                Dependency::Pending => return ComputeResult::Pending,
                Dependency::Unreachable => return ComputeResult::Unreachable,
            }
        }
        out.push(MetricSample::new("process_total", time, total));
        ComputeResult::Done
    }
}

enum Dependency {
    Ready(f64),
    Pending,
    Unreachable,
}

enum ComputeResult {
    Done,
    Pending,
    Unreachable,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> DerivationEngine {
        DerivationEngine::new(Vec::new(), None, &[], Vec::new())
    }

    #[test]
    fn parses_load_longterm() {
        let engine = engine();
        let cache = SampleCache::new();
        let mut out = Vec::new();
        engine.feed_line("host.load.longterm 1.25 1000", &cache, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].measurement, "system_load15");
        assert_eq!(out[0].value, 1.25);
    }

    #[test]
    fn unmatched_plugin_is_dropped() {
        let engine = engine();
        let cache = SampleCache::new();
        let mut out = Vec::new();
        engine.feed_line("host.totally_unknown.thing 1 1000", &cache, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn malformed_line_does_not_panic() {
        let engine = engine();
        let cache = SampleCache::new();
        let mut out = Vec::new();
        engine.feed_line("not a valid line at all", &cache, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn disk_total_waits_for_all_dependencies() {
        let engine = engine();
        let cache = SampleCache::new();
        let mut out = Vec::new();

        engine.feed_line("host.df-root.df_complex-used 50 2000", &cache, &mut out);
        for s in &out {
            cache.put(s.clone());
        }
        out.clear();

        // only `used` present: disk_total stays pending
        engine.drain_pending(&cache, &mut out);
        assert!(out.iter().all(|s| s.measurement != "disk_total"));

        engine.feed_line("host.df-root.df_complex-free 50 2000", &cache, &mut out);
        for s in out.clone() {
            cache.put(s);
        }
        engine.drain_pending(&cache, &mut out);
        let total = out.iter().find(|s| s.measurement == "disk_total").unwrap();
        assert_eq!(total.value, 100.0);
    }

    #[test]
    fn disk_path_canonicalization() {
        let engine = engine();
        let cache = SampleCache::new();
        let mut out = Vec::new();
        engine.feed_line("host.df-home.df_complex-used 1 100", &cache, &mut out);
        assert_eq!(out[0].item.as_deref(), Some("/home"));
    }

    #[test]
    fn network_interface_blacklist_drops_samples() {
        let engine = DerivationEngine::new(Vec::new(), None, &[], vec!["lo".to_string()]);
        let cache = SampleCache::new();
        let mut out = Vec::new();
        engine.feed_line("host.interface-lo.if_octets-rx 100 1000", &cache, &mut out);
        assert!(out.is_empty());
    }
}
