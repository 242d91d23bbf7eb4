use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResource {
    LlmRequests,
    LlmTokens,
    ToolCalls,
    ExecutionTimeS,
    MemoryMb,
    ConcurrentTasks,
}

impl QuotaResource {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaResource::LlmRequests => "llm_requests",
            QuotaResource::LlmTokens => "llm_tokens",
            QuotaResource::ToolCalls => "tool_calls",
            QuotaResource::ExecutionTimeS => "execution_time_s",
            QuotaResource::MemoryMb => "memory_mb",
            QuotaResource::ConcurrentTasks => "concurrent_tasks",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "llm_requests" => Some(QuotaResource::LlmRequests),
            "llm_tokens" => Some(QuotaResource::LlmTokens),
            "tool_calls" => Some(QuotaResource::ToolCalls),
            "execution_time_s" => Some(QuotaResource::ExecutionTimeS),
            "memory_mb" => Some(QuotaResource::MemoryMb),
            "concurrent_tasks" => Some(QuotaResource::ConcurrentTasks),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPeriod {
    PerMinute,
    PerHour,
    PerDay,
    Total,
}

impl QuotaPeriod {
    pub fn window_ms(self) -> Option<u64> {
        match self {
            QuotaPeriod::PerMinute => Some(60_000),
            QuotaPeriod::PerHour => Some(3_600_000),
            QuotaPeriod::PerDay => Some(86_400_000),
            QuotaPeriod::Total => None,
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "per_minute" => Some(QuotaPeriod::PerMinute),
            "per_hour" => Some(QuotaPeriod::PerHour),
            "per_day" => Some(QuotaPeriod::PerDay),
            "total" => Some(QuotaPeriod::Total),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaLimit {
    pub resource: QuotaResource,
    pub period: QuotaPeriod,
    pub limit: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernorConfig {
    #[serde(default)]
    pub limits: Vec<QuotaLimit>,
    pub max_concurrent_tasks: Option<u64>,
}

#[derive(Debug, Clone, Default)]
struct WindowCounter {
    window_start_ms: u64,
    used: u64,
}

/// Fixed-window accounting per (resource, period). A window resets when its
/// period has fully elapsed; `total` windows never reset.
pub(crate) struct QuotaLedger {
    limits: Vec<QuotaLimit>,
    counters: HashMap<(QuotaResource, QuotaPeriod), WindowCounter>,
}

impl QuotaLedger {
    pub fn new(limits: Vec<QuotaLimit>) -> Self {
        Self {
            limits,
            counters: HashMap::new(),
        }
    }

    fn used_in_window(&mut self, resource: QuotaResource, period: QuotaPeriod, now_ms: u64) -> u64 {
        let counter = self.counters.entry((resource, period)).or_default();
        if let Some(window) = period.window_ms() {
            if now_ms.saturating_sub(counter.window_start_ms) >= window {
                counter.window_start_ms = now_ms;
                counter.used = 0;
            }
        }
        counter.used
    }

    pub fn check(&mut self, resource: QuotaResource, cost: u64, now_ms: u64) -> bool {
        let limits = self
            .limits
            .iter()
            .filter(|l| l.resource == resource)
            .cloned()
            .collect::<Vec<_>>();
        for limit in limits {
            let used = self.used_in_window(resource, limit.period, now_ms);
            if used.saturating_add(cost) > limit.limit {
                return false;
            }
        }
        true
    }

    pub fn consume(&mut self, resource: QuotaResource, cost: u64, now_ms: u64) {
        let periods = self
            .limits
            .iter()
            .filter(|l| l.resource == resource)
            .map(|l| l.period)
            .collect::<Vec<_>>();
        for period in periods {
            self.used_in_window(resource, period, now_ms);
            if let Some(counter) = self.counters.get_mut(&(resource, period)) {
                counter.used = counter.used.saturating_add(cost);
            }
        }
    }

    /// Tightest remaining headroom across configured windows, `None` when
    /// the resource is unbounded.
    pub fn remaining(&mut self, resource: QuotaResource, now_ms: u64) -> Option<u64> {
        let limits = self
            .limits
            .iter()
            .filter(|l| l.resource == resource)
            .cloned()
            .collect::<Vec<_>>();
        if limits.is_empty() {
            return None;
        }
        let mut tightest = u64::MAX;
        for limit in limits {
            let used = self.used_in_window(resource, limit.period, now_ms);
            tightest = tightest.min(limit.limit.saturating_sub(used));
        }
        Some(tightest)
    }
}
