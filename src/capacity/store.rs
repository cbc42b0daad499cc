//! 积压/活跃条目存储
//!
//! 两种可互换的线程安全容器: 有序列表 `ItemList` 和按 id 索引的 `ItemMap`.
//! 遍历时先在锁内复制一份, 出锁后再调用回调.

use std::collections::HashMap;

use super::{CapacityManagerItem, CapacityTracker};
use crate::resource::ResourceUsageData;
use crate::sync::TracedMutex;

/// 按加入顺序保存的条目列表
#[derive(Debug)]
pub struct ItemList {
    items: TracedMutex<Vec<CapacityManagerItem>>,
}

impl Default for ItemList {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemList {
    pub fn new() -> Self {
        Self {
            items: TracedMutex::new("CapacityManager.ItemList", Vec::new()),
        }
    }

    pub fn add(&self, item: CapacityManagerItem) {
        self.items.lock().push(item);
    }

    pub fn remove(&self, id: &str) {
        self.items.lock().retain(|item| item.id != id);
    }

    pub fn get(&self, id: &str) -> Option<CapacityManagerItem> {
        self.items.lock().iter().find(|item| item.id == id).cloned()
    }

    pub fn count(&self) -> usize {
        self.items.lock().len()
    }

    pub fn iterate(&self, handler: &mut dyn FnMut(&CapacityManagerItem)) {
        let snapshot = self.items.lock().clone();
        for item in &snapshot {
            handler(item);
        }
    }
}

/// 按 id 索引的条目表, 遍历顺序不保证
#[derive(Debug)]
pub struct ItemMap {
    items: TracedMutex<HashMap<String, CapacityManagerItem>>,
}

impl Default for ItemMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemMap {
    pub fn new() -> Self {
        Self {
            items: TracedMutex::new("CapacityManager.ItemMap", HashMap::new()),
        }
    }

    pub fn add(&self, item: CapacityManagerItem) {
        self.items.lock().insert(item.id.clone(), item);
    }

    pub fn remove(&self, id: &str) {
        self.items.lock().remove(id);
    }

    pub fn get(&self, id: &str) -> Option<CapacityManagerItem> {
        self.items.lock().get(id).cloned()
    }

    pub fn count(&self) -> usize {
        self.items.lock().len()
    }

    pub fn iterate(&self, handler: &mut dyn FnMut(&CapacityManagerItem)) {
        let snapshot: Vec<CapacityManagerItem> = self.items.lock().values().cloned().collect();
        for item in &snapshot {
            handler(item);
        }
    }
}

/// 不依赖状态机的独立容量跟踪器: 积压用列表(保持 FIFO), 活跃用表.
#[derive(Debug, Default)]
pub struct ItemStoreTracker {
    backlog: ItemList,
    active: ItemMap,
}

impl ItemStoreTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_to_backlog(&self, id: &str, requirements: ResourceUsageData) {
        self.backlog.add(CapacityManagerItem {
            id: id.to_string(),
            requirements,
        });
    }

    pub fn add_to_active(&self, id: &str, requirements: ResourceUsageData) {
        self.active.add(CapacityManagerItem {
            id: id.to_string(),
            requirements,
        });
    }

    /// 从积压移到活跃. 不在积压里返回 false
    pub fn move_to_active(&self, id: &str) -> bool {
        match self.backlog.get(id) {
            Some(item) => {
                self.backlog.remove(id);
                self.active.add(item);
                true
            }
            None => {
                log::warn!("item {} not in backlog", id);
                false
            }
        }
    }

    pub fn remove(&self, id: &str) {
        self.backlog.remove(id);
        self.active.remove(id);
    }

    pub fn backlog(&self) -> &ItemList {
        &self.backlog
    }

    pub fn active(&self) -> &ItemMap {
        &self.active
    }
}

impl CapacityTracker for ItemStoreTracker {
    fn backlog_iterator(&self, handler: &mut dyn FnMut(&CapacityManagerItem)) {
        self.backlog.iterate(handler);
    }

    fn active_iterator(&self, handler: &mut dyn FnMut(&CapacityManagerItem)) {
        self.active.iterate(handler);
    }
}
