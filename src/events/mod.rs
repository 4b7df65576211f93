//! 生命周期事件
//!
//! - `event` - 事件与过滤器
//! - `bus` - 发布订阅总线

pub mod bus;
pub mod event;

pub use bus::{DispatchStats, EventBus, EventBusConfig, EventCallback};
pub use event::{lifecycle_events, matches_pattern, Event, EventFilter, INSTALLER_SENDER};
