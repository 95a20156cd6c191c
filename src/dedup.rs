//! セッション単位の重複排除

use crate::models::ChatEvent;
use std::collections::{HashSet, VecDeque};

/// 配信済みイベントIDの集合
///
/// 上限を超えたら古いIDから捨てる。
#[derive(Debug, Clone)]
pub struct DedupWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// 未見のイベントだけを順序を保って返し、そのIDを記録する
    ///
    /// 同じバッチ内の重複も落とす。
    pub fn filter(&mut self, events: Vec<ChatEvent>) -> Vec<ChatEvent> {
        let before = events.len();
        let admitted: Vec<ChatEvent> = events
            .into_iter()
            .filter(|event| self.admit(&event.id))
            .collect();

        if admitted.len() < before {
            tracing::debug!(
                "🔁 Suppressed {} duplicate events",
                before - admitted.len()
            );
        }
        admitted
    }

    fn admit(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// 保存されなかったイベントのIDを戻し、次のポーリングで再度受け入れる
    pub fn forget<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        let removed: HashSet<&str> = ids
            .into_iter()
            .filter(|id| self.seen.remove(*id))
            .collect();
        if !removed.is_empty() {
            self.order.retain(|id| !removed.contains(id.as_str()));
        }
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
