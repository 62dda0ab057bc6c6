use super::{ConsumeOutcome, LimitStore, WindowRecord, WindowView};
use crate::error::Result;
use crate::plan::Resource;
use dashmap::DashMap;
use std::collections::VecDeque;

// In-memory store backed by DashMap. The per-key entry lock makes each
// window record and each usage increment atomic, so a single instance never
// over-admits. Multi-instance deployments need the Redis store instead.
#[derive(Default)]
pub struct MemoryStore {
    // subject key -> ordered request timestamps (epoch ms) in the window
    windows: DashMap<String, VecDeque<i64>>,
    // "tenant:resource" -> cumulative count for the billing period
    usage: DashMap<String, i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn usage_key(tenant: &str, resource: Resource) -> String {
        format!("{}:{}", tenant, resource.as_str())
    }

    fn purge(stamps: &mut VecDeque<i64>, cutoff_ms: i64) {
        while stamps.front().is_some_and(|&t| t < cutoff_ms) {
            stamps.pop_front();
        }
    }
}

#[async_trait::async_trait]
impl LimitStore for MemoryStore {
    async fn record(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        max_requests: u32,
    ) -> Result<WindowRecord> {
        let mut entry = self.windows.entry(key.to_string()).or_default();
        let stamps = entry.value_mut();

        Self::purge(stamps, now_ms - window_ms);

        let count = stamps.len() as u32;
        let admitted = count < max_requests;
        if admitted {
            stamps.push_back(now_ms);
        }

        Ok(WindowRecord {
            admitted,
            count: if admitted { count + 1 } else { count },
            oldest_ms: stamps.front().copied(),
        })
    }

    async fn observe(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<WindowView> {
        match self.windows.get_mut(key) {
            Some(mut entry) => {
                let stamps = entry.value_mut();
                Self::purge(stamps, now_ms - window_ms);
                Ok(WindowView {
                    count: stamps.len() as u32,
                    oldest_ms: stamps.front().copied(),
                })
            }
            None => Ok(WindowView {
                count: 0,
                oldest_ms: None,
            }),
        }
    }

    async fn try_consume(
        &self,
        tenant: &str,
        resource: Resource,
        limit: i64,
    ) -> Result<ConsumeOutcome> {
        let mut entry = self
            .usage
            .entry(Self::usage_key(tenant, resource))
            .or_insert(0);
        let current = entry.value_mut();

        let allowed = limit < 0 || *current < limit;
        if allowed {
            *current += 1;
        }

        Ok(ConsumeOutcome {
            allowed,
            current: *current,
        })
    }

    async fn resource_usage(&self, tenant: &str, resource: Resource) -> Result<i64> {
        Ok(self
            .usage
            .get(&Self::usage_key(tenant, resource))
            .map(|v| *v.value())
            .unwrap_or(0))
    }

    async fn set_usage(&self, tenant: &str, resource: Resource, value: i64) -> Result<()> {
        self.usage.insert(Self::usage_key(tenant, resource), value);
        Ok(())
    }

    async fn sweep(&self, now_ms: i64, idle_ms: i64) -> Result<usize> {
        let before = self.windows.len();
        self.windows
            .retain(|_, stamps| stamps.back().is_some_and(|&t| now_ms - t < idle_ms));
        crate::metrics::WINDOW_ENTRIES.set(self.windows.len() as f64);
        Ok(before.saturating_sub(self.windows.len()))
    }
}
