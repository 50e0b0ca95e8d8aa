// 统一低延迟视频流传输系统 - 频道注册表实现

use crate::channel::ChannelShared;
use common::{ChannelInfo, RestreamError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// 按频道号索引的频道注册表
///
/// 克隆开销很小，HTTP 层和启动代码共享同一份映射。
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Arc<DashMap<u32, Arc<ChannelShared>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
        }
    }

    /// 注册频道，同号频道会被替换
    pub fn register(&self, channel: Arc<ChannelShared>) {
        let number = channel.number();
        if self.channels.insert(number, channel).is_some() {
            warn!("ch{}: replaced an existing registration", number);
        } else {
            debug!("ch{}: registered", number);
        }
    }

    pub fn get(&self, number: u32) -> Option<Arc<ChannelShared>> {
        self.channels.get(&number).map(|entry| entry.value().clone())
    }

    /// 获取频道，不存在时返回 `ChannelNotFound`
    pub fn require(&self, number: u32) -> Result<Arc<ChannelShared>> {
        self.get(number).ok_or(RestreamError::ChannelNotFound(number))
    }

    /// 所有频道的快照，按频道号排序
    pub fn list(&self) -> Vec<ChannelInfo> {
        let mut infos: Vec<ChannelInfo> = self
            .channels
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by_key(|info| info.number);
        infos
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn channel(number: u32) -> Arc<ChannelShared> {
        Arc::new(ChannelShared::new(
            number,
            format!("Channel {}", number),
            4,
            CancellationToken::new(),
        ))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ChannelRegistry::new();
        assert!(registry.is_empty());

        registry.register(channel(3));
        registry.register(channel(1));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(3).map(|c| c.number()), Some(3));
        assert!(registry.get(2).is_none());
        assert!(matches!(
            registry.require(2),
            Err(RestreamError::ChannelNotFound(2))
        ));
    }

    #[test]
    fn test_list_sorted_by_number() {
        let registry = ChannelRegistry::new();
        for n in [7, 2, 5] {
            registry.register(channel(n));
        }

        let numbers: Vec<u32> = registry.list().iter().map(|info| info.number).collect();
        assert_eq!(numbers, vec![2, 5, 7]);
    }

    #[test]
    fn test_clones_share_state() {
        let registry = ChannelRegistry::new();
        let clone = registry.clone();
        clone.register(channel(9));
        assert!(registry.get(9).is_some());
    }
}
