mod balancer;
mod ollama;
mod pool;

pub use balancer::{EndpointHealth, EndpointStatus, LoadBalancer};
pub use ollama::{SummarizeError, Summarizer};
pub use pool::{PoolError, PoolStats, SummaryPool, SummaryRequest};
