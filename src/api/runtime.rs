use serde::{Deserialize, Serialize};

/// Host load figures reported on `/caps`. Each field is absent when its
/// `/proc` source could not be read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loadavg: Option<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memfree_kb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memavail_kb: Option<u64>,
}

impl RuntimeStats {
    pub async fn read() -> Self {
        let uptime = tokio::fs::read_to_string("/proc/uptime").await.ok();
        let loadavg = tokio::fs::read_to_string("/proc/loadavg").await.ok();
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await.ok();

        let (memfree_kb, memavail_kb) = meminfo.as_deref().map(parse_meminfo).unwrap_or_default();
        Self {
            uptime_s: uptime.as_deref().and_then(parse_uptime),
            loadavg: loadavg.as_deref().and_then(parse_loadavg),
            memfree_kb,
            memavail_kb,
        }
    }
}

fn parse_uptime(contents: &str) -> Option<f64> {
    contents.split_whitespace().next()?.parse().ok()
}

fn parse_loadavg(contents: &str) -> Option<[f64; 3]> {
    let mut fields = contents.split_whitespace().map(|f| f.parse::<f64>());
    match (fields.next(), fields.next(), fields.next()) {
        (Some(Ok(a)), Some(Ok(b)), Some(Ok(c))) => Some([a, b, c]),
        _ => None,
    }
}

/// `(MemFree, MemAvailable)` in kB.
fn parse_meminfo(contents: &str) -> (Option<u64>, Option<u64>) {
    let mut free = None;
    let mut avail = None;
    for line in contents.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let value = rest.split_whitespace().next().and_then(|v| v.parse().ok());
        match key {
            "MemFree" => free = value,
            "MemAvailable" => avail = value,
            _ => {}
        }
    }
    (free, avail)
}
