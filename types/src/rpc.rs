use serde::{Deserialize, Serialize};

/// Reporting window for the `counter(window, type)` RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterWindow {
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
}

impl CounterWindow {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "5m" => Some(Self::FiveMinutes),
            "1h" => Some(Self::OneHour),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FiveMinutes => "5m",
            Self::OneHour => "1h",
        }
    }
}

/// Metric category for the `counter(window, type)` RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    All,
    Pending,
    Success,
    Retry,
    Failed,
    Speed,
    Time,
}

impl CounterKind {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "all" => Some(Self::All),
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "retry" => Some(Self::Retry),
            "failed" => Some(Self::Failed),
            "speed" => Some(Self::Speed),
            "time" => Some(Self::Time),
            _ => None,
        }
    }
}

/// Envelope for the binary-packed `fetch` RPC call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcFetchRequest {
    pub task: crate::task::Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcFetchResponse {
    pub result: crate::result::FetchResult,
}
